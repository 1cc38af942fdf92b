use anyhow::Result;

pub const METRIC_OPEN_FDS: &str = "process_open_fds";
pub const METRIC_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
pub const METRIC_THREADS: &str = "process_threads";

/// Register the Prometheus recommended process metrics.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_proc_metrics() {
    metrics::register_gauge!(METRIC_OPEN_FDS, metrics::Unit::Count, "Number of open file descriptors.");
    metrics::register_gauge!(METRIC_RESIDENT_MEMORY_BYTES, metrics::Unit::Bytes, "Resident memory size in bytes.");
    metrics::register_gauge!(METRIC_THREADS, metrics::Unit::Count, "Number of OS threads in the process.");
}

/// Collect a sample of process metrics.
#[cfg(not(feature = "prom"))]
pub fn collect_proc_metrics() -> Result<()> {
    anyhow::bail!("metrics sampling is only configured for Linux")
}

/// Collect a sample of process metrics.
#[cfg(feature = "prom")]
pub fn collect_proc_metrics() -> Result<()> {
    use anyhow::Context;
    let proc = procfs::process::Process::myself().context("error gathering process metrics")?;
    match proc.fd_count() {
        Ok(open_fds) => metrics::gauge!(METRIC_OPEN_FDS, open_fds as f64),
        Err(err) => tracing::error!(error = ?err, "error gathering metric {}", METRIC_OPEN_FDS),
    }
    if let (Ok(statm), Ok(page_size)) = (proc.statm(), procfs::page_size()) {
        metrics::gauge!(METRIC_RESIDENT_MEMORY_BYTES, statm.resident as f64 * page_size as f64);
    }
    let stat = proc.stat().context("error reading process stat")?;
    metrics::gauge!(METRIC_THREADS, stat.num_threads as f64);
    Ok(())
}

/// Spawn a process metrics sampler which will shutdown when the given `shutdown` future resolves.
pub fn spawn_proc_metrics_sampler(shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> tokio::task::JoinHandle<()> {
    if cfg!(feature = "prom") {
        tokio::spawn(async move {
            let mut sample_interval = tokio::time::interval(std::time::Duration::from_secs(5));
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = sample_interval.tick() => match collect_proc_metrics() {
                        Ok(_) => continue,
                        Err(err) => tracing::error!(error = ?err, "error collecting process metrics sample"),
                    },
                    _ = &mut shutdown => break,
                }
            }
        })
    } else {
        tokio::spawn(async move {})
    }
}
