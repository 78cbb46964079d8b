//! Tracing and OpenTelemetry initialisation for drivecore processes.
//!
//! Every vehicle pipeline opens one `tick` span per cycle carrying the
//! `vehicle` and `cycle` fields; fleet tasks additionally run inside a
//! `vehicle_task` span. Console lines and exported spans of a fleet can
//! therefore be told apart per vehicle.
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL; enables span export over HTTP. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `DRIVECORE_LOG_FORMAT` | `json` for newline-delimited JSON, anything else for compact lines. |
//!
//! ```rust,no_run
//! // Hold the guard for the entire lifetime of the process.
//! let _guard = drivecore_runtime::telemetry::init_tracing("drivecore");
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FORMAT_VAR: &str = "DRIVECORE_LOG_FORMAT";
const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// How a process reports its logs and spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    /// Spans are exported only when set.
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Reads `DRIVECORE_LOG_FORMAT` and `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env(service_name: &str) -> Self {
        Self::from_vars(
            service_name,
            std::env::var(LOG_FORMAT_VAR).ok().as_deref(),
            std::env::var(OTLP_ENDPOINT_VAR).ok().as_deref(),
        )
    }

    fn from_vars(service_name: &str, log_format: Option<&str>, endpoint: Option<&str>) -> Self {
        Self {
            service_name: service_name.to_string(),
            log_format: LogFormat::parse(log_format),
            otlp_endpoint: endpoint
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        }
    }

    /// Install the global subscriber. Panics if one is already installed.
    pub fn init(&self) -> TracerProviderGuard {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let console: Box<dyn Layer<Registry> + Send + Sync> = match self.log_format {
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
            LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        };

        let provider = self.build_provider();
        let otel_layer = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("drivecore")));

        tracing_subscriber::registry()
            .with(console)
            .with(env_filter)
            .with(otel_layer)
            .init();

        TracerProviderGuard(provider)
    }

    /// `None` when no endpoint is configured or the exporter cannot be built
    /// (the error goes to stderr and only console output remains).
    fn build_provider(&self) -> Option<SdkTracerProvider> {
        let endpoint = self.otlp_endpoint.clone()?;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| eprintln!("[drivecore] OTLP exporter init failed: {e}"))
            .ok()?;

        Some(
            SdkTracerProvider::builder()
                .with_resource(self.resource())
                // Tracing starts before any Tokio runtime exists, so the batch
                // exporter (which spawns tasks) cannot be used here.
                .with_simple_exporter(exporter)
                .build(),
        )
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
            .build()
    }
}

/// Initialise tracing from the environment; see the module docs.
///
/// The returned [`TracerProviderGuard`] must be held for the lifetime of the
/// process; dropping it flushes pending spans.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    TelemetryConfig::from_env(service_name).init()
}

/// Shuts down the OTel [`SdkTracerProvider`] on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// Whether spans are being exported.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[drivecore] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_is_case_insensitive() {
        let cfg = TelemetryConfig::from_vars("drivecore", Some(" JSON "), None);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.service_name, "drivecore");
    }

    #[test]
    fn unknown_or_missing_format_is_compact() {
        assert_eq!(TelemetryConfig::from_vars("d", Some("pretty"), None).log_format, LogFormat::Compact);
        assert_eq!(TelemetryConfig::from_vars("d", None, None).log_format, LogFormat::Compact);
    }

    #[test]
    fn blank_endpoint_disables_export() {
        let cfg = TelemetryConfig::from_vars("drivecore", None, Some("  "));
        assert_eq!(cfg.otlp_endpoint, None);
        assert!(cfg.build_provider().is_none());
    }

    #[test]
    fn endpoint_is_trimmed() {
        let cfg = TelemetryConfig::from_vars("drivecore", None, Some(" http://localhost:4318 "));
        assert_eq!(cfg.otlp_endpoint.as_deref(), Some("http://localhost:4318"));
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        let guard = TracerProviderGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }
}
