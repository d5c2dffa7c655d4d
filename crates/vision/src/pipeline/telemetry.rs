//! Telemetry helpers for tracing subscribers, Prometheus metrics and named
//! pipeline threads.

use std::{io, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps a thread-scoped subscriber installed when a global one already existed.
pub struct TelemetryGuard {
    _default_guard: Option<tracing::subscriber::DefaultGuard>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            tracing::warn!(
                "metrics recorder already installed, prometheus output stays empty: {err}"
            );
        }

        let upkeep_handle = handle.clone();
        match spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            }
        }) {
            Ok(join) => {
                let _ = PROM_UPKEEP_THREAD.set(join);
            }
            Err(err) => tracing::warn!("failed to spawn prometheus upkeep thread: {err}"),
        }

        handle
    })
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Render all recorded metrics in the Prometheus text format.
pub fn render_metrics() -> Option<String> {
    prometheus_handle().map(PrometheusHandle::render)
}

fn env_filter(opts: &TelemetryOptions) -> EnvFilter {
    if let Some(directives) = opts.log_filter.as_deref() {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid log filter {directives:?}: {err}"),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if opts.verbose { "debug" } else { "info" })
    })
}

/// Install the tracing subscriber used by the pipeline.
///
/// The subscriber becomes the global default when none is set yet, otherwise
/// it is scoped to the calling thread for the lifetime of the guard.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(io::stderr)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter(opts)),
        )
        .with(tracing_error::ErrorLayer::default());

    let dispatch = tracing::Dispatch::new(subscriber);
    let default_guard = match tracing::dispatcher::set_global_default(dispatch.clone()) {
        Ok(()) => None,
        Err(_) => Some(tracing::dispatcher::set_default(&dispatch)),
    };

    TelemetryGuard {
        _default_guard: default_guard,
    }
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
