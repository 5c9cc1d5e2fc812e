use fleet_providers::inventory::{RemoteInstance, RemoteSnapshot};
use fleet_providers::{normalize_keys, ApiError, CloudProvider, ErrorClass, KeyStyle, Params};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{ApiFailure, PermanentKind};

// Upper bound for a single backoff delay, whatever the multiplier.
const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Bound on one provider call, independent of the HTTP client's own timeout.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay slept after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= MAX_DELAY.as_secs_f64() {
            return MAX_DELAY;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

/// One raw cloud call. Request params are kept in snake_case; the key style
/// actually sent is chosen per attempt.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    CreateInstance(&'a Params),
    GetInstance(&'a str),
    ListInstances,
    StartInstance(&'a str),
    StopInstance(&'a str),
    DeleteInstance(&'a str),
    CreateSnapshot(&'a Params),
    GetSnapshot(&'a str),
    ListSnapshots,
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateInstance(_) => "create_instance",
            Operation::GetInstance(_) => "get_instance",
            Operation::ListInstances => "list_instances",
            Operation::StartInstance(_) => "start_instance",
            Operation::StopInstance(_) => "stop_instance",
            Operation::DeleteInstance(_) => "delete_instance",
            Operation::CreateSnapshot(_) => "create_snapshot",
            Operation::GetSnapshot(_) => "get_snapshot",
            Operation::ListSnapshots => "list_snapshots",
        }
    }

    fn params(&self) -> Option<&Params> {
        match self {
            Operation::CreateInstance(p) | Operation::CreateSnapshot(p) => Some(*p),
            _ => None,
        }
    }

    fn target(&self) -> Option<&str> {
        match self {
            Operation::GetInstance(id)
            | Operation::StartInstance(id)
            | Operation::StopInstance(id)
            | Operation::DeleteInstance(id)
            | Operation::GetSnapshot(id) => Some(*id),
            _ => None,
        }
    }

    async fn dispatch(&self, provider: &dyn CloudProvider, style: KeyStyle) -> anyhow::Result<Value> {
        match *self {
            Operation::CreateInstance(p) => provider.create_instance(&p.restyled(style)).await,
            Operation::GetInstance(id) => provider.get_instance(id).await,
            Operation::ListInstances => provider.list_instances().await,
            Operation::StartInstance(id) => provider.start_instance(id).await,
            Operation::StopInstance(id) => provider.stop_instance(id).await,
            Operation::DeleteInstance(id) => provider.delete_instance(id).await,
            Operation::CreateSnapshot(p) => provider.create_snapshot(&p.restyled(style)).await,
            Operation::GetSnapshot(id) => provider.get_snapshot(id).await,
            Operation::ListSnapshots => provider.list_snapshots().await,
        }
    }
}

/// Per-call knobs on top of the retry policy.
#[derive(Clone, Copy)]
pub struct InvokeOptions {
    pub policy: RetryPolicy,
    /// Dotted path into the normalized body, e.g. `"instance"`.
    pub extract_path: Option<&'static str>,
    /// Shape check on the extracted value; a miss is retried like a transport error.
    pub validate: Option<fn(&Value) -> bool>,
}

struct AttemptError {
    class: ErrorClass,
    message: String,
}

impl AttemptError {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }
}

fn classify(err: anyhow::Error) -> AttemptError {
    let class = if let Some(api) = err.downcast_ref::<ApiError>() {
        api.class()
    } else if let Some(re) = err.downcast_ref::<reqwest::Error>() {
        match re.status() {
            Some(status) => ApiError::status(status.as_u16(), "").class(),
            None => ErrorClass::Transient,
        }
    } else {
        ErrorClass::Permanent
    };
    AttemptError {
        class,
        message: format!("{:#}", err),
    }
}

fn shape(body: Value, opts: &InvokeOptions) -> Result<Value, AttemptError> {
    let mut value = normalize_keys(body);
    if let Some(path) = opts.extract_path {
        for segment in path.split('.') {
            value = match value {
                Value::Object(mut map) => map
                    .remove(segment)
                    .ok_or_else(|| AttemptError::transient(format!("response has no '{}'", path)))?,
                _ => {
                    return Err(AttemptError::transient(format!(
                        "response has no '{}'",
                        path
                    )))
                }
            };
        }
    }
    if let Some(validate) = opts.validate {
        if !validate(&value) {
            return Err(AttemptError::transient("response failed validation"));
        }
    }
    Ok(value)
}

fn has_id(v: &Value) -> bool {
    v.get("id").is_some_and(Value::is_string)
}

fn is_array(v: &Value) -> bool {
    v.is_array()
}

fn decode<T: DeserializeOwned>(operation: &'static str, value: Value) -> Result<T, ApiFailure> {
    serde_json::from_value(value).map_err(|e| ApiFailure::schema(operation, e.to_string()))
}

/// Cloud API adapter: timeout, exponential backoff, response normalization,
/// and the one-shot parameter casing fallback.
#[derive(Clone)]
pub struct RetryingClient {
    provider: Arc<dyn CloudProvider>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(provider: Arc<dyn CloudProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    fn options(&self, extract_path: Option<&'static str>, validate: Option<fn(&Value) -> bool>) -> InvokeOptions {
        InvokeOptions {
            policy: self.policy,
            extract_path,
            validate,
        }
    }

    pub async fn invoke(&self, op: Operation<'_>, opts: &InvokeOptions) -> Result<Value, ApiFailure> {
        let name = op.name();
        let target = op.target().unwrap_or("-");
        let mut style = KeyStyle::Snake;
        let mut fallback_used = false;
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = match timeout(
                opts.policy.attempt_timeout,
                op.dispatch(self.provider.as_ref(), style),
            )
            .await
            {
                Ok(res) => res.map_err(classify),
                Err(_) => Err(AttemptError::transient(format!(
                    "no response within {:?}",
                    opts.policy.attempt_timeout
                ))),
            }
            .and_then(|body| shape(body, opts));

            let err = match result {
                Ok(value) => {
                    tracing::debug!(
                        operation = name,
                        target,
                        attempt = attempt + 1,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "[retry_client] ok"
                    );
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err.class {
                ErrorClass::ClientRequest if op.params().is_some() && !fallback_used => {
                    fallback_used = true;
                    style = style.alternate();
                    tracing::warn!(
                        operation = name,
                        attempt = attempt + 1,
                        error = %err.message,
                        "[retry_client] request refused, retrying once with {:?} keys",
                        style
                    );
                }
                ErrorClass::Transient if attempt < opts.policy.max_retries => {
                    let delay = opts.policy.delay_for(attempt);
                    tracing::warn!(
                        operation = name,
                        target,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "[retry_client] transient failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                ErrorClass::Transient => {
                    tracing::error!(
                        operation = name,
                        target,
                        attempts = attempt + 1,
                        error = %err.message,
                        "[retry_client] retries exhausted"
                    );
                    return Err(ApiFailure::Transient {
                        operation: name,
                        attempts: attempt + 1,
                        last_error: err.message,
                    });
                }
                class => {
                    let kind = match class {
                        ErrorClass::NotFound => PermanentKind::NotFound,
                        ErrorClass::ClientRequest => PermanentKind::ClientRequest,
                        _ => PermanentKind::Rejected,
                    };
                    if kind == PermanentKind::NotFound {
                        tracing::debug!(operation = name, target, "[retry_client] not found");
                    } else {
                        tracing::warn!(
                            operation = name,
                            target,
                            attempt = attempt + 1,
                            error = %err.message,
                            "[retry_client] permanent failure"
                        );
                    }
                    return Err(ApiFailure::Permanent {
                        operation: name,
                        kind,
                        reason: err.message,
                    });
                }
            }
        }
    }

    pub async fn create_instance(&self, params: &Params) -> Result<RemoteInstance, ApiFailure> {
        let op = Operation::CreateInstance(params);
        let value = self.invoke(op, &self.options(Some("instance"), Some(has_id))).await?;
        decode(op.name(), value)
    }

    pub async fn fetch_instance(&self, instance_id: &str) -> Result<RemoteInstance, ApiFailure> {
        let op = Operation::GetInstance(instance_id);
        let value = self.invoke(op, &self.options(Some("instance"), Some(has_id))).await?;
        decode(op.name(), value)
    }

    pub async fn list_instances(&self) -> Result<Vec<RemoteInstance>, ApiFailure> {
        let op = Operation::ListInstances;
        let value = self.invoke(op, &self.options(Some("instances"), Some(is_array))).await?;
        decode(op.name(), value)
    }

    pub async fn start_instance(&self, instance_id: &str) -> Result<(), ApiFailure> {
        self.invoke(Operation::StartInstance(instance_id), &self.options(None, None))
            .await
            .map(|_| ())
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<(), ApiFailure> {
        self.invoke(Operation::StopInstance(instance_id), &self.options(None, None))
            .await
            .map(|_| ())
    }

    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), ApiFailure> {
        self.invoke(Operation::DeleteInstance(instance_id), &self.options(None, None))
            .await
            .map(|_| ())
    }

    pub async fn create_snapshot(&self, params: &Params) -> Result<RemoteSnapshot, ApiFailure> {
        let op = Operation::CreateSnapshot(params);
        let value = self.invoke(op, &self.options(Some("snapshot"), Some(has_id))).await?;
        decode(op.name(), value)
    }

    pub async fn fetch_snapshot(&self, snapshot_id: &str) -> Result<RemoteSnapshot, ApiFailure> {
        let op = Operation::GetSnapshot(snapshot_id);
        let value = self.invoke(op, &self.options(Some("snapshot"), Some(has_id))).await?;
        decode(op.name(), value)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<RemoteSnapshot>, ApiFailure> {
        let op = Operation::ListSnapshots;
        let value = self.invoke(op, &self.options(Some("snapshots"), Some(is_array))).await?;
        decode(op.name(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_providers::mock::{MockOp, MockProvider, MockReply};
    use serde_json::json;

    fn client(mock: &Arc<MockProvider>) -> RetryingClient {
        RetryingClient::new(mock.clone(), RetryPolicy::default())
    }

    #[test]
    fn delays_grow_geometrically_and_saturate() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(60), MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_back_off_d_then_d_times_multiplier() {
        let mock = Arc::new(MockProvider::new());
        mock.insert_instance("a", json!({}));
        mock.script(
            MockOp::GetInstance,
            [
                MockReply::Status(503, "unavailable".into()),
                MockReply::Transport("connection reset".into()),
            ],
        );

        let inst = client(&mock).fetch_instance("a").await.unwrap();
        assert_eq!(inst.id, "a");

        let calls = mock.calls_of(MockOp::GetInstance);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].at - calls[0].at, Duration::from_millis(500));
        assert_eq!(calls[2].at - calls[1].at, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_transient_failure() {
        let mock = Arc::new(MockProvider::new());
        mock.script(
            MockOp::ListInstances,
            (0..4).map(|_| MockReply::Status(502, "bad gateway".into())),
        );

        let err = client(&mock).list_instances().await.unwrap_err();
        match err {
            ApiFailure::Transient {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("502"));
            }
            other => panic!("expected transient failure, got {other:?}"),
        }
        assert_eq!(mock.call_count(MockOp::ListInstances), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_never_retried() {
        let mock = Arc::new(MockProvider::new());
        let err = client(&mock).fetch_instance("missing").await.unwrap_err();
        assert!(err.is_absent());
        assert_eq!(mock.call_count(MockOp::GetInstance), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn casing_fallback_is_tried_once_without_delay() {
        let mock = Arc::new(MockProvider::new());
        mock.require_key_style(KeyStyle::Camel);
        let params = Params::new()
            .with("snapshot_id", "snap-1")
            .with("label", "web");

        let inst = client(&mock).create_instance(&params).await.unwrap();
        assert_eq!(inst.label, "web");

        let calls = mock.calls_of(MockOp::CreateInstance);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].at, calls[1].at);
        let sent = calls[1].params.as_ref().unwrap();
        assert!(sent.get("snapshotId").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_in_both_conventions_is_permanent() {
        let mock = Arc::new(MockProvider::new());
        mock.script(
            MockOp::CreateSnapshot,
            [
                MockReply::Status(400, "bad".into()),
                MockReply::Status(422, "still bad".into()),
            ],
        );
        let params = Params::new().with("instance_id", "i-1");

        let err = client(&mock).create_snapshot(&params).await.unwrap_err();
        assert!(matches!(
            err,
            ApiFailure::Permanent {
                kind: PermanentKind::ClientRequest,
                ..
            }
        ));
        assert_eq!(mock.call_count(MockOp::CreateSnapshot), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_without_params_has_no_fallback() {
        let mock = Arc::new(MockProvider::new());
        mock.script(MockOp::StartInstance, [MockReply::Status(400, "nope".into())]);

        let err = client(&mock).start_instance("i-1").await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(mock.call_count(MockOp::StartInstance), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_shape_is_retried() {
        let mock = Arc::new(MockProvider::new());
        mock.insert_instance("a", json!({}));
        mock.script(MockOp::GetInstance, [MockReply::Ok(json!({ "unexpected": true }))]);

        let inst = client(&mock).fetch_instance("a").await.unwrap();
        assert_eq!(inst.id, "a");
        assert_eq!(mock.call_count(MockOp::GetInstance), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_mismatch_is_permanent() {
        let mock = Arc::new(MockProvider::new());
        mock.script(
            MockOp::GetInstance,
            [MockReply::Ok(json!({ "instance": { "id": "a" } }))],
        );

        let err = client(&mock).fetch_instance("a").await.unwrap_err();
        assert!(matches!(
            err,
            ApiFailure::Permanent {
                kind: PermanentKind::Schema,
                ..
            }
        ));
        assert_eq!(mock.call_count(MockOp::GetInstance), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_are_normalized_before_decoding() {
        let mock = Arc::new(MockProvider::new());
        mock.script(
            MockOp::GetInstance,
            [MockReply::Ok(json!({
                "instance": {
                    "id": "a",
                    "status": "active",
                    "powerStatus": "stopped",
                    "main-ip": "5.6.7.8"
                }
            }))],
        );

        let inst = client(&mock).fetch_instance("a").await.unwrap();
        assert_eq!(inst.power_status, fleet_common::PowerStatus::Stopped);
        assert_eq!(inst.real_ip().as_deref(), Some("5.6.7.8"));
    }
}
