//! Parallel downloads: one worker thread per serial port.

use {
    crate::{
        CancelToken,
        config::SessionConfig,
        connection::Transport,
        download::{DownloadPlan, Downloader, PortOutcome, Stage},
        error::{Error, Result},
        port::Port,
        target::ChipFamily,
    },
    log::{debug, error, info, warn},
    std::{
        sync::{Arc, mpsc},
        thread,
        time::{Duration, Instant},
    },
};

/// Per-port progress callback: `(port, stage, done, total)`.
pub type BatchProgress = Arc<dyn Fn(&str, Stage, usize, usize) + Send + Sync>;

/// Outcomes of a batch, sorted by port name.
#[derive(Debug)]
pub struct BatchReport {
    /// One outcome per distinct port.
    pub outcomes: Vec<PortOutcome>,
    /// Wall time of the whole batch.
    pub elapsed: Duration,
}

/// Serializable view of one [`PortOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortSummary {
    /// Port name.
    pub port: String,
    /// Whether every stage passed.
    pub passed: bool,
    /// Failing stage.
    pub stage: Option<Stage>,
    /// Error message.
    pub error: Option<String>,
    /// Detected chip family.
    pub chip: Option<ChipFamily>,
    /// Elapsed milliseconds.
    pub elapsed_ms: u128,
}

impl BatchReport {
    /// Whether every port passed.
    pub fn all_passed(&self) -> bool {
        self.outcomes
            .iter()
            .all(PortOutcome::is_success)
    }

    /// Number of ports that passed.
    pub fn passed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .count()
    }

    /// Number of ports that failed.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    /// Per-port summaries for reporting.
    pub fn summaries(&self) -> Vec<PortSummary> {
        self.outcomes
            .iter()
            .map(|o| PortSummary {
                port: o
                    .port
                    .clone(),
                passed: o.is_success(),
                stage: o
                    .result
                    .as_ref()
                    .err()
                    .and_then(Error::stage),
                error: o
                    .result
                    .as_ref()
                    .err()
                    .map(ToString::to_string),
                chip: o
                    .chip
                    .map(|c| c.family),
                elapsed_ms: o
                    .elapsed
                    .as_millis(),
            })
            .collect()
    }
}

fn distinct(ports: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(ports.len());
    for port in ports {
        if seen.contains(port) {
            warn!("Ignoring duplicate port {port}");
        } else {
            seen.push(port.clone());
        }
    }
    seen
}

/// Run `plan` on every port in parallel, opening each with `open`.
///
/// Each worker owns its transport. Results come back over a channel and every
/// worker is joined before returning.
pub fn run_batch_with<P, F>(
    ports: &[String],
    open: F,
    plan: Arc<DownloadPlan>,
    config: Arc<SessionConfig>,
    cancel: &CancelToken,
    progress: BatchProgress,
) -> BatchReport
where
    P: Port + 'static,
    F: Fn(&str) -> Result<Transport<P>> + Send + Sync + 'static,
{
    let started = Instant::now();
    let ports = distinct(ports);
    let open = Arc::new(open);
    let (tx, rx) = mpsc::channel::<PortOutcome>();
    let mut outcomes = Vec::with_capacity(ports.len());
    let mut workers = Vec::with_capacity(ports.len());

    info!("Starting download on {} port(s)", ports.len());
    for port in &ports {
        let worker_port = port.clone();
        let open = Arc::clone(&open);
        let plan = Arc::clone(&plan);
        let downloader = Downloader::new(Arc::clone(&config), cancel.clone());
        let progress = Arc::clone(&progress);
        let tx = tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("bkflash {port}"))
            .spawn(move || {
                let outcome = match open(&worker_port) {
                    Ok(transport) => downloader.run(transport, &plan, &mut |stage, done, total| {
                        progress(&worker_port, stage, done, total);
                    }),
                    Err(e) => {
                        error!("{worker_port}: cannot open: {e}");
                        PortOutcome::failed(worker_port.as_str(), e.in_stage(Stage::Link))
                    },
                };
                if tx
                    .send(outcome)
                    .is_err()
                {
                    debug!("{worker_port}: batch receiver gone");
                }
            });

        match spawned {
            Ok(handle) => workers.push((port.clone(), handle)),
            Err(e) => outcomes.push(PortOutcome::failed(port.as_str(), Error::Io(e))),
        }
    }
    drop(tx);

    outcomes.extend(rx.iter());
    for (port, handle) in workers {
        if handle
            .join()
            .is_err()
            && !outcomes
                .iter()
                .any(|o| o.port == port)
        {
            outcomes.push(PortOutcome::failed(
                port.as_str(),
                Error::Transport(format!("worker for {port} panicked")),
            ));
        }
    }

    outcomes.sort_by(|a, b| a.port.cmp(&b.port));
    let report = BatchReport {
        outcomes,
        elapsed: started.elapsed(),
    };
    info!(
        "Batch finished in {:.3}s: {} passed, {} failed",
        report.elapsed.as_secs_f64(),
        report.passed(),
        report.failed()
    );
    report
}

/// Run `plan` on every named serial port in parallel.
#[cfg(feature = "native")]
pub fn run_batch(
    ports: &[String],
    plan: Arc<DownloadPlan>,
    config: Arc<SessionConfig>,
    cancel: &CancelToken,
    progress: BatchProgress,
) -> BatchReport {
    let link_baud = config.link_baud;
    run_batch_with(
        ports,
        move |name| Transport::open(name, link_baud),
        plan,
        config,
        cancel,
        progress,
    )
}
