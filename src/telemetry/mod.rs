//! Tracing subscriber setup.
//!
//! The runtime only emits `tracing` events; installing a subscriber is the
//! application's choice. [`init`] wires up the conventional stack: env
//! filter (from `RUST_LOG`, with `.env` loaded first), compact fmt output,
//! and `tracing-error`'s span traces for diagnostic reports.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the default subscriber. Panics if one is already set; use
/// [`try_init`] when that is not a bug.
pub fn init() {
    try_init().expect("tracing subscriber already installed");
}

/// Installs the default subscriber, returning an error if one exists.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .with(ErrorLayer::default())
        .try_init()?;
    Ok(())
}
