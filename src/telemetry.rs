//! Prometheus metrics recorder.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the process-wide metrics recorder on first call and returns the
/// handle used to render `/metrics`. Later calls return the same handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            warn!(error = %err, "Metrics recorder already installed; /metrics will be empty");
        }

        let upkeep = handle.clone();
        let spawned = thread::Builder::new()
            .name("prometheus-upkeep".into())
            .spawn(move || {
                loop {
                    thread::sleep(UPKEEP_INTERVAL);
                    upkeep.run_upkeep();
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn metrics upkeep thread");
        }

        handle
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_installs_once() {
        let a = init_metrics_recorder() as *const PrometheusHandle;
        let b = init_metrics_recorder() as *const PrometheusHandle;
        assert_eq!(a, b);
        assert!(prometheus_handle().is_some());
    }
}
