//! Telemetry initialization.
//!
//! Nothing in this crate initializes logging or metrics as an import side
//! effect; the embedding process calls [`init_telemetry`] exactly once at
//! startup. Metric counters are emitted through the `metrics` facade and go
//! nowhere until the process installs a recorder.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber (fmt layer + `RUST_LOG` env filter).
///
/// Idempotent: repeat calls are no-ops, so library tests and embedding
/// binaries can both call it safely.
pub fn init_telemetry() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        if let Err(err) = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
        {
            eprintln!("tracing init failed: {err}");
        }
    });
}
