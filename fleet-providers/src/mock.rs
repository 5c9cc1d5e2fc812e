use crate::{ApiError, CloudProvider, KeyStyle, Params};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Raw operations recorded by [`MockProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateInstance,
    GetInstance,
    ListInstances,
    StartInstance,
    StopInstance,
    DeleteInstance,
    CreateSnapshot,
    GetSnapshot,
    ListSnapshots,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub op: MockOp,
    pub target: Option<String>,
    pub params: Option<Params>,
    pub at: Instant,
}

/// A scripted reply: either a body or a failure.
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok(Value),
    Status(u16, String),
    Transport(String),
}

impl MockReply {
    fn into_result(self) -> Result<Value> {
        match self {
            MockReply::Ok(v) => Ok(v),
            MockReply::Status(status, body) => Err(ApiError::status(status, body).into()),
            MockReply::Transport(msg) => Err(ApiError::Transport(msg).into()),
        }
    }
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, Value>,
    snapshots: HashMap<String, Value>,
    // Per-op queue consulted before the default behaviour.
    scripts: HashMap<MockOp, VecDeque<MockReply>>,
    // Per-resource queue for GET, consulted before `scripts`.
    instance_reads: HashMap<String, VecDeque<MockReply>>,
    snapshot_reads: HashMap<String, VecDeque<MockReply>>,
    required_key_style: Option<KeyStyle>,
    calls: Vec<MockCall>,
    next_id: u64,
}

/// In-memory cloud used by tests and local runs (`PROVIDER=mock`).
///
/// Without scripting, instances come up `active`/`running` with an IP as soon
/// as they are created, power actions take effect immediately, and deleted
/// instances answer 404. Scripts override single replies in FIFO order.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a remote instance. Missing fields get defaults.
    pub fn insert_instance(&self, id: &str, fields: Value) {
        let mut body = json!({
            "id": id,
            "label": id,
            "status": "active",
            "power_status": "running",
            "main_ip": "10.0.0.1",
            "region": "dfw",
            "plan": "vc2-1c-1gb",
        });
        merge(&mut body, fields);
        self.state().instances.insert(id.to_string(), body);
    }

    pub fn insert_snapshot(&self, id: &str, fields: Value) {
        let mut body = json!({
            "id": id,
            "description": id,
            "status": "complete",
            "size_gb": 25.0,
        });
        merge(&mut body, fields);
        self.state().snapshots.insert(id.to_string(), body);
    }

    /// Queues replies for the next calls of `op`.
    pub fn script(&self, op: MockOp, replies: impl IntoIterator<Item = MockReply>) {
        self.state()
            .scripts
            .entry(op)
            .or_default()
            .extend(replies);
    }

    /// Queues replies for the next reads of one instance.
    pub fn script_instance_reads(&self, id: &str, replies: impl IntoIterator<Item = MockReply>) {
        self.state()
            .instance_reads
            .entry(id.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn script_snapshot_reads(&self, id: &str, replies: impl IntoIterator<Item = MockReply>) {
        self.state()
            .snapshot_reads
            .entry(id.to_string())
            .or_default()
            .extend(replies);
    }

    /// Refuse (HTTP 400) any request whose params are not written in `style`.
    pub fn require_key_style(&self, style: KeyStyle) {
        self.state().required_key_style = Some(style);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, op: MockOp) -> Vec<MockCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    fn begin(&self, op: MockOp, target: Option<&str>, params: Option<&Params>) -> Option<MockReply> {
        let mut st = self.state();
        st.calls.push(MockCall {
            op,
            target: target.map(str::to_string),
            params: params.cloned(),
            at: Instant::now(),
        });

        if let (Some(style), Some(params)) = (st.required_key_style, params) {
            if let Some(bad) = params.keys().find(|k| !style.matches(k)) {
                return Some(MockReply::Status(
                    400,
                    format!("invalid parameter '{}'", bad),
                ));
            }
        }

        let per_resource = match (op, target) {
            (MockOp::GetInstance, Some(id)) => st.instance_reads.get_mut(id).and_then(|q| q.pop_front()),
            (MockOp::GetSnapshot, Some(id)) => st.snapshot_reads.get_mut(id).and_then(|q| q.pop_front()),
            _ => None,
        };
        per_resource.or_else(|| st.scripts.get_mut(&op).and_then(|q| q.pop_front()))
    }

    fn allocate_id(&self, prefix: &str) -> String {
        let mut st = self.state();
        st.next_id += 1;
        format!("{}-{}", prefix, st.next_id)
    }

    fn set_power(&self, id: &str, power: &str) -> Result<Value> {
        let mut st = self.state();
        match st.instances.get_mut(id) {
            Some(inst) => {
                inst["power_status"] = json!(power);
                Ok(Value::Null)
            }
            None => Err(ApiError::not_found(id).into()),
        }
    }
}

fn merge(base: &mut Value, fields: Value) {
    if let (Some(base), Value::Object(fields)) = (base.as_object_mut(), fields) {
        for (k, v) in fields {
            base.insert(k, v);
        }
    }
}

fn param_str(params: &Params, snake: &str) -> Option<String> {
    params
        .get(snake)
        .or_else(|| params.get(&KeyStyle::Camel.apply(snake)))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_instance(&self, params: &Params) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::CreateInstance, None, Some(params)) {
            return reply.into_result();
        }
        let id = self.allocate_id("inst");
        let n = self.state().next_id;
        let body = json!({
            "id": id,
            "label": param_str(params, "label").unwrap_or_default(),
            "status": "active",
            "power_status": "running",
            "main_ip": format!("10.0.0.{}", n % 250 + 2),
            "region": param_str(params, "region"),
            "plan": param_str(params, "plan"),
        });
        self.state().instances.insert(id, body.clone());
        Ok(json!({ "instance": body }))
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::GetInstance, Some(instance_id), None) {
            return reply.into_result();
        }
        match self.state().instances.get(instance_id) {
            Some(inst) => Ok(json!({ "instance": inst })),
            None => Err(ApiError::not_found(instance_id).into()),
        }
    }

    async fn list_instances(&self) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::ListInstances, None, None) {
            return reply.into_result();
        }
        let mut items: Vec<Value> = self.state().instances.values().cloned().collect();
        items.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        Ok(json!({ "instances": items }))
    }

    async fn start_instance(&self, instance_id: &str) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::StartInstance, Some(instance_id), None) {
            return reply.into_result();
        }
        self.set_power(instance_id, "running")
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::StopInstance, Some(instance_id), None) {
            return reply.into_result();
        }
        self.set_power(instance_id, "stopped")
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::DeleteInstance, Some(instance_id), None) {
            return reply.into_result();
        }
        match self.state().instances.remove(instance_id) {
            Some(_) => Ok(Value::Null),
            None => Err(ApiError::not_found(instance_id).into()),
        }
    }

    async fn create_snapshot(&self, params: &Params) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::CreateSnapshot, None, Some(params)) {
            return reply.into_result();
        }
        let id = self.allocate_id("snap");
        let body = json!({
            "id": id,
            "description": param_str(params, "description").unwrap_or_default(),
            "instance_id": param_str(params, "instance_id"),
            "status": "complete",
            "size_gb": 25.0,
        });
        self.state().snapshots.insert(id, body.clone());
        Ok(json!({ "snapshot": body }))
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::GetSnapshot, Some(snapshot_id), None) {
            return reply.into_result();
        }
        match self.state().snapshots.get(snapshot_id) {
            Some(snap) => Ok(json!({ "snapshot": snap })),
            None => Err(ApiError::not_found(snapshot_id).into()),
        }
    }

    async fn list_snapshots(&self) -> Result<Value> {
        if let Some(reply) = self.begin(MockOp::ListSnapshots, None, None) {
            return reply.into_result();
        }
        let mut items: Vec<Value> = self.state().snapshots.values().cloned().collect();
        items.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        Ok(json!({ "snapshots": items }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_instances_are_readable_until_deleted() {
        let mock = MockProvider::new();
        let created = mock
            .create_instance(&Params::new().with("label", "web").with("region", "dfw"))
            .await
            .unwrap();
        let id = created["instance"]["id"].as_str().unwrap().to_string();

        let read = mock.get_instance(&id).await.unwrap();
        assert_eq!(read["instance"]["label"], "web");

        mock.delete_instance(&id).await.unwrap();
        let err = mock.get_instance(&id).await.unwrap_err();
        let api = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api.class(), crate::ErrorClass::NotFound);
        assert_eq!(mock.call_count(MockOp::GetInstance), 2);
    }

    #[tokio::test]
    async fn scripted_reads_take_priority() {
        let mock = MockProvider::new();
        mock.insert_instance("a", json!({}));
        mock.script_instance_reads("a", [MockReply::Status(503, "busy".into())]);

        assert!(mock.get_instance("a").await.is_err());
        assert!(mock.get_instance("a").await.is_ok());
    }

    #[tokio::test]
    async fn required_key_style_refuses_other_conventions() {
        let mock = MockProvider::new();
        mock.require_key_style(KeyStyle::Camel);
        let params = Params::new().with("snapshot_id", "s");

        let err = mock.create_instance(&params).await.unwrap_err();
        let api = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api.class(), crate::ErrorClass::ClientRequest);

        assert!(mock
            .create_instance(&params.restyled(KeyStyle::Camel))
            .await
            .is_ok());
    }
}
