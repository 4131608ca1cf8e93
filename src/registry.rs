//! Maps job type names to the code that runs them.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{ExecError, JobError, QueueError};
use crate::parser::is_valid_name;
use crate::types::job::Payload;

/// The body of a job type. Delivery is at-least-once: a job interrupted by a
/// crash or a timeout runs again, so `perform` must be idempotent.
///
/// A timed-out run is aborted, but a handler that never reaches an `.await`
/// can't be stopped and keeps going in the background. Its retry may start
/// while it is still running, so two runs of the same job can overlap.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, payload: &Payload) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn perform(&self, payload: &Payload) -> Result<(), JobError> {
        self(payload.clone()).await
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        job_type: &str,
        handler: H,
    ) -> Result<(), QueueError>
    where
        H: JobHandler + 'static,
    {
        if !is_valid_name(job_type.as_bytes()) {
            return Err(QueueError::InvalidName(job_type.to_owned()));
        }
        if self.handlers.contains_key(job_type) {
            return Err(QueueError::DuplicateHandler(job_type.to_owned()));
        }

        self.handlers.insert(job_type.to_owned(), Arc::new(handler));
        debug!(job_type, "registered handler");

        Ok(())
    }

    pub fn get(
        &self,
        job_type: &str,
    ) -> Result<Arc<dyn JobHandler>, ExecError> {
        self.handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| ExecError::UnknownJobType(job_type.to_owned()))
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Runs a job inline, skipping the queue entirely, and hands back the
    /// handler's own error.
    #[instrument(skip(self, payload), err)]
    pub async fn perform_now(
        &self,
        job_type: &str,
        payload: &Payload,
    ) -> Result<(), ExecError> {
        let handler = self.get(job_type)?;
        handler.perform(payload).await?;
        Ok(())
    }
}
