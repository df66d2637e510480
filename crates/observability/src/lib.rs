use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide telemetry handles. Keep the guard alive for the lifetime of
/// the process or buffered log lines are lost on exit.
pub struct Telemetry {
    pub prometheus: PrometheusHandle,
    _log_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Installs the tracing subscriber (non-blocking stdout, `RUST_LOG`-style
/// filtering) and the Prometheus recorder. Safe to call more than once; the
/// first call wins.
pub fn init_telemetry(service_name: &str) -> Telemetry {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    let prometheus = PROM_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone();

    Telemetry {
        prometheus,
        _log_guard: guard,
    }
}
