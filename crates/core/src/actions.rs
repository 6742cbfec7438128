// Step execution and action dispatch
//
// The step executor resolves a step's input, dispatches on its type and
// bounds the call with a per-type timeout. Action-level failures come back
// as `ActionOutcome { success: false }`; only infrastructure faults are
// errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::ActionError;
use crate::model::{StepSpec, StepType};

/// Config key overriding a step's time bound
pub const TIMEOUT_CONFIG_KEY: &str = "timeoutMs";

/// Result reported by an action executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// ActionExecutor - capabilities provided by the integration layer
// ============================================================================

/// Capability interface for step side effects
///
/// Implementations can:
/// - Call HTTP endpoints and integration services
/// - Record calls in memory for testing
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    async fn http_request(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError>;

    async fn webhook(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError>;

    async fn notify_user(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError>;

    async fn publish_content(&self, input: &Map<String, Value>)
        -> Result<ActionOutcome, ActionError>;

    async fn ai_generate(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError>;
}

// ============================================================================
// StepExecutor
// ============================================================================

/// Outcome of one step, with the input it ran on
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub input: Value,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Dispatches steps to an [`ActionExecutor`]
#[derive(Clone)]
pub struct StepExecutor {
    actions: Arc<dyn ActionExecutor>,
}

impl StepExecutor {
    pub fn new(actions: Arc<dyn ActionExecutor>) -> Self {
        Self { actions }
    }

    /// Resolve input and run the step
    #[instrument(skip(self, step, context), fields(step_id = %step.id, step_type = ?step.step_type))]
    pub async fn execute(&self, step: &StepSpec, context: &Value) -> Result<StepOutcome, ActionError> {
        let input = resolve_input(step, context);

        let limit = step_timeout(step);
        let call = self.dispatch(step.step_type, &input);
        let outcome = match tokio::time::timeout(limit, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "step timed out");
                return Err(ActionError::Timeout(limit));
            }
        };

        Ok(StepOutcome {
            input: Value::Object(input),
            success: outcome.success,
            output: outcome.output,
            error: outcome.error,
        })
    }

    async fn dispatch(
        &self,
        step_type: StepType,
        input: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        match step_type {
            StepType::HttpRequest => self.actions.http_request(input).await,
            StepType::Webhook => self.actions.webhook(input).await,
            StepType::NotifyUser => self.actions.notify_user(input).await,
            StepType::ArticlePublish => self.actions.publish_content(input).await,
            StepType::AiGenerate => self.actions.ai_generate(input).await,
            // Decided through review tasks and transitions
            StepType::ManualTask | StepType::ArticleReview => {
                debug!("human-driven step, passing through");
                Ok(ActionOutcome::ok(Value::Object(input.clone())))
            }
        }
    }
}

/// Step config defaults overlaid with mapped context values
///
/// A mapping whose source is absent from the context leaves the default.
/// Executor-only settings such as the timeout override are not passed on.
pub fn resolve_input(step: &StepSpec, context: &Value) -> Map<String, Value> {
    let mut input = step.config.clone();
    for mapping in &step.input_mapping {
        if let Some(value) = lookup(context, &mapping.source) {
            input.insert(mapping.target.clone(), value.clone());
        }
    }
    input.remove(TIMEOUT_CONFIG_KEY);
    input
}

/// Exact key first, then a dotted path
fn lookup<'a>(context: &'a Value, source: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(source) {
        return Some(value);
    }
    source
        .split('.')
        .try_fold(context, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Time bound for a step: `config.timeoutMs` or the per-type default
pub fn step_timeout(step: &StepSpec) -> Duration {
    if let Some(ms) = step.config.get(TIMEOUT_CONFIG_KEY).and_then(Value::as_u64) {
        return Duration::from_millis(ms);
    }
    match step.step_type {
        StepType::AiGenerate => Duration::from_secs(300),
        StepType::HttpRequest | StepType::Webhook => Duration::from_secs(60),
        StepType::NotifyUser | StepType::ArticlePublish => Duration::from_secs(120),
        StepType::ManualTask | StepType::ArticleReview => Duration::from_secs(60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(&'static str, Map<String, Value>)>>,
        delay: Option<Duration>,
    }

    impl Recorder {
        async fn record(&self, kind: &'static str, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().push((kind, input.clone()));
            if input.get("fail").is_some() {
                return Ok(ActionOutcome::failed("status 422"));
            }
            Ok(ActionOutcome::ok(json!({"kind": kind})))
        }
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn http_request(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
            self.record("http", input).await
        }
        async fn webhook(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
            self.record("webhook", input).await
        }
        async fn notify_user(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
            self.record("notify", input).await
        }
        async fn publish_content(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
            self.record("publish", input).await
        }
        async fn ai_generate(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
            self.record("ai", input).await
        }
    }

    #[test]
    fn test_mapping_wins_over_config() {
        let step = StepSpec::new("notify", 1, StepType::NotifyUser)
            .with_config("template", json!("default"))
            .with_config("userId", json!("fallback"))
            .with_mapping("content.authorId", "userId")
            .with_mapping("missing.path", "template");

        let context = json!({"content": {"authorId": "a-7"}});
        let input = resolve_input(&step, &context);
        assert_eq!(input["userId"], json!("a-7"));
        assert_eq!(input["template"], json!("default"));
    }

    #[test]
    fn test_exact_key_takes_precedence_over_path() {
        let context = json!({"a.b": 1, "a": {"b": 2}, "items": [10, 20]});
        assert_eq!(lookup(&context, "a.b"), Some(&json!(1)));
        assert_eq!(lookup(&context, "items.1"), Some(&json!(20)));
    }

    #[test]
    fn test_timeouts_per_type() {
        assert_eq!(step_timeout(&StepSpec::new("a", 1, StepType::AiGenerate)), Duration::from_secs(300));
        assert_eq!(step_timeout(&StepSpec::new("w", 1, StepType::Webhook)), Duration::from_secs(60));
        assert_eq!(step_timeout(&StepSpec::new("p", 1, StepType::ArticlePublish)), Duration::from_secs(120));
        let overridden = StepSpec::new("h", 1, StepType::HttpRequest).with_config(TIMEOUT_CONFIG_KEY, json!(1500));
        assert_eq!(step_timeout(&overridden), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_dispatch_on_step_type() {
        let recorder = Arc::new(Recorder::default());
        let executor = StepExecutor::new(recorder.clone());

        let outcome = executor
            .execute(&StepSpec::new("pub", 1, StepType::ArticlePublish), &json!({}))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, Some(json!({"kind": "publish"})));

        let failed = executor
            .execute(
                &StepSpec::new("hook", 2, StepType::Webhook).with_config("fail", json!(true)),
                &json!({}),
            )
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("status 422"));

        let manual = executor
            .execute(&StepSpec::new("review", 3, StepType::ManualTask), &json!({}))
            .await
            .unwrap();
        assert!(manual.success);
        assert_eq!(recorder.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_human_driven_step_passes_input_through() {
        let recorder = Arc::new(Recorder::default());
        let executor = StepExecutor::new(recorder.clone());
        let step = StepSpec::new("review", 1, StepType::ArticleReview)
            .with_config("reviewer", json!("desk"))
            .with_mapping("input.articleId", "articleId");

        let outcome = executor
            .execute(&step, &json!({"input": {"articleId": 9}}))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.input, json!({"reviewer": "desk", "articleId": 9}));
        assert_eq!(outcome.output, Some(outcome.input.clone()));
        assert!(recorder.calls.lock().is_empty());
    }

    #[test]
    fn test_timeout_override_is_not_forwarded() {
        let step = StepSpec::new("h", 1, StepType::HttpRequest)
            .with_config("url", json!("https://example.org"))
            .with_config(TIMEOUT_CONFIG_KEY, json!(1500));

        let input = resolve_input(&step, &json!({}));
        assert!(!input.contains_key(TIMEOUT_CONFIG_KEY));
        assert_eq!(input["url"], json!("https://example.org"));
        assert_eq!(step_timeout(&step), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_action_times_out() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_secs(120)),
            ..Default::default()
        });
        let executor = StepExecutor::new(recorder);

        let result = executor
            .execute(&StepSpec::new("hook", 1, StepType::Webhook), &json!({}))
            .await;
        assert!(matches!(result, Err(ActionError::Timeout(d)) if d == Duration::from_secs(60)));
    }
}
