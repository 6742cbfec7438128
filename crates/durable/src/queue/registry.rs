//! Explicit queue → handler registry

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::job::{Job, JobError};

/// Job handler result
pub type JobResult = Result<serde_json::Value, JobError>;

/// Job handler function type
///
/// Handlers receive the job by value; all other dependencies are captured
/// by the closure at registration time.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, JobResult> + Send + Sync>;

/// Map of queue name to its handler, built once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a queue, replacing any previous one
    pub fn register<F, Fut>(&mut self, queue_name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| Box::pin(handler(job)));
        self.handlers.insert(queue_name.into(), handler);
        self
    }

    pub fn get(&self, queue_name: &str) -> Option<JobHandler> {
        self.handlers.get(queue_name).cloned()
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.handlers.contains_key(queue_name)
    }

    /// Registered queue names, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("email:send", |job: Job| async move { Ok(job.payload) })
            .register("ai:content", |_job: Job| async move {
                Err(JobError::new("provider down"))
            });

        assert_eq!(registry.queues(), vec!["ai:content", "email:send"]);

        let handler = registry.get("email:send").unwrap();
        let job = Job::new("email:send", "welcome", json!({"to": 1}), &JobOptions::default());
        assert_eq!(handler(job).await.unwrap(), json!({"to": 1}));

        assert!(registry.get("unknown").is_none());
    }
}
