//! Job types built into the server binary.
use std::time::Duration;

use anyhow::Result;
use backburner::error::JobError;
use backburner::registry::Registry;
use backburner::types::job::Payload;
use tracing::info;

pub(crate) fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register("sleep", sleep)?;
    registry.register("log", log)?;
    Ok(registry)
}

/// Sleeps for `payload[0]` seconds. Handy for watching the pool at work.
async fn sleep(payload: Payload) -> Result<(), JobError> {
    let secs = match &payload[0] {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    .ok_or_else(|| {
        JobError::permanent(format!("not a duration: {}", payload[0]))
    })?;

    info!(?secs, "starting the sleep job");
    tokio::time::sleep(secs).await;
    info!("sleep job done");

    Ok(())
}

async fn log(payload: Payload) -> Result<(), JobError> {
    info!(%payload, "log job");
    Ok(())
}
