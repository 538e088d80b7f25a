//! Configuration file support for bkflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BKFLASH_*)
//! 3. Local config file (./bkflash.toml or ./bkflash_ports.toml)
//! 4. Global config file (~/.config/bkflash/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const LOCAL_CONFIG: &str = "bkflash.toml";
const LOCAL_PORTS: &str = "bkflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial ports to flash; more than one runs a parallel download.
    #[serde(default)]
    pub serial: Vec<String>,
    /// Baud rate used while linking.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Extra USB bridges treated as known devices.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Working baud rate after the link is up.
    pub baud: Option<u32>,
    /// Reset technique (0-3 or its name).
    pub reset: Option<String>,
    /// Link-check handshake (rom, bootloader, mixed).
    pub link_check: Option<String>,
    /// Number of link attempts.
    pub link_attempts: Option<u32>,
    /// Per-command retries.
    pub retries: Option<u32>,
    /// Verify every segment after programming.
    #[serde(default)]
    pub verify: bool,
    /// Skip programming of all-0xFF pages.
    #[serde(default)]
    pub skip_blank: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(ports_config) = Self::load_ports_config() {
            config.merge_ports(ports_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Remembered bridges, local file first.
    fn load_ports_config() -> Option<PortConfig> {
        let candidates = [
            Some(PathBuf::from(LOCAL_PORTS)),
            Self::global_config_dir().map(|dir| dir.join("ports.toml")),
        ];

        candidates
            .into_iter()
            .flatten()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                match toml::from_str(&content) {
                    Ok(config) => {
                        debug!("Loaded ports config from {}", path.display());
                        Some(config)
                    },
                    Err(e) => {
                        warn!("Failed to parse ports file {}: {e}", path.display());
                        None
                    },
                }
            })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bkflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    fn merge(&mut self, other: Self) {
        self.merge_ports(other.port);

        let flash = other.flash;
        if flash.baud.is_some() {
            self.flash.baud = flash.baud;
        }
        if flash.reset.is_some() {
            self.flash.reset = flash.reset;
        }
        if flash.link_check.is_some() {
            self.flash.link_check = flash.link_check;
        }
        if flash.link_attempts.is_some() {
            self.flash.link_attempts = flash.link_attempts;
        }
        if flash.retries.is_some() {
            self.flash.retries = flash.retries;
        }
        self.flash.verify |= flash.verify;
        self.flash.skip_blank |= flash.skip_blank;
    }

    fn merge_ports(&mut self, other: PortConfig) {
        if !other.connection.serial.is_empty() {
            self.port.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.port.connection.baud = other.connection.baud;
        }
        for device in other.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }
    }

    /// Whether `vid:pid` is one of the remembered bridges.
    pub fn is_remembered(&self, vid: u16, pid: u16) -> bool {
        self.port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid))
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self.is_remembered(vid, pid) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port
            .usb_device
            .push(UsbDevice { vid, pid });

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_empty() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_empty());
        assert!(config.port.connection.baud.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.flash.baud.is_none());
        assert!(!config.flash.verify);
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        assert!(device.matches(0x1A86, 0x7523));
        assert!(!device.matches(0x1A86, 0x7522));
        assert!(!device.matches(0x10C4, 0x7523));
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[port.connection]
serial = ["/dev/ttyUSB0", "/dev/ttyUSB1"]
baud = 115200

[[port.usb_device]]
vid = 6790
pid = 29987

[flash]
baud = 2000000
reset = "multi"
link_check = "mixed"
link_attempts = 50
retries = 3
verify = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.port.connection.serial,
            vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]
        );
        assert_eq!(config.port.connection.baud, Some(115_200));
        assert_eq!(config.port.usb_device.len(), 1);
        assert_eq!(config.flash.baud, Some(2_000_000));
        assert_eq!(config.flash.reset.as_deref(), Some("multi"));
        assert_eq!(config.flash.link_check.as_deref(), Some("mixed"));
        assert_eq!(config.flash.link_attempts, Some(50));
        assert_eq!(config.flash.retries, Some(3));
        assert!(config.flash.verify);
        assert!(!config.flash.skip_blank);
    }

    #[test]
    fn test_parse_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.connection.serial.is_empty());
        assert!(config.flash.reset.is_none());
    }

    #[test]
    fn test_merge_overrides_set_values_only() {
        let mut base = Config::default();
        base.port.connection.serial = vec!["/dev/ttyUSB0".into()];
        base.flash.baud = Some(1_000_000);
        base.flash.retries = Some(2);

        let mut other = Config::default();
        other.flash.baud = Some(2_000_000);
        other.flash.verify = true;

        base.merge(other);
        assert_eq!(base.port.connection.serial, vec!["/dev/ttyUSB0"]);
        assert_eq!(base.flash.baud, Some(2_000_000));
        assert_eq!(base.flash.retries, Some(2));
        assert!(base.flash.verify);
    }

    #[test]
    fn test_merge_deduplicates_usb_devices() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        let mut base = Config::default();
        base.port.usb_device.push(device.clone());

        let mut other = Config::default();
        other.port.usb_device.push(device);
        other.port.usb_device.push(UsbDevice {
            vid: 0x10C4,
            pid: 0xEA60,
        });

        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
        assert!(base.is_remembered(0x10C4, 0xEA60));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[flash]\nbaud = 921600\nskip_blank = true\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.flash.baud, Some(921_600));
        assert!(config.flash.skip_blank);
    }

    #[test]
    fn test_load_from_missing_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("missing.toml"));
        assert!(config.flash.baud.is_none());
    }

    #[test]
    fn test_load_from_invalid_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[flash\nbaud = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.flash.baud.is_none());
    }

    #[test]
    fn test_ports_config_roundtrip_shape() {
        let mut port = PortConfig::default();
        port.usb_device.push(UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        });
        let text = toml::to_string_pretty(&port).unwrap();
        let parsed: PortConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.usb_device, port.usb_device);
    }
}
