//! The process-wide broker instance.
//!
//! Construction is gated on `V3_ENABLED` and happens at most once; the
//! instance owns the requeue workers, so teardown must go through
//! [`shutdown`].

use crate::broker::Marqs;
use crate::config::MarqsConfig;
use tokio::sync::OnceCell;

static INSTANCE: OnceCell<Marqs> = OnceCell::const_new();

fn enabled() -> bool {
    std::env::var("V3_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Builds the global broker from the environment, once. Returns `None` when
/// `V3_ENABLED` is not set.
pub async fn init_from_env() -> crate::Result<Option<&'static Marqs>> {
    if !enabled() {
        return Ok(None);
    }

    let marqs = INSTANCE
        .get_or_try_init(|| async { Marqs::builder(MarqsConfig::from_env()).build().await })
        .await?;
    Ok(Some(marqs))
}

/// The global broker, if it has been initialized.
pub fn instance() -> Option<&'static Marqs> {
    INSTANCE.get()
}

/// Stops the global broker's requeue workers.
pub async fn shutdown() {
    if let Some(marqs) = INSTANCE.get() {
        marqs.shutdown().await;
    }
}
