//! Agent runtime ABI: one call, one turn, one result or error.
//!
//! Three backends implement the same contract: an in-process stub, a child
//! process speaking NDJSON, and a remote streaming endpoint. Intermediate
//! events flow only through the `emit` callback; the scheduler owns retries.

mod remote;
mod stub;
mod subprocess;

pub use remote::RemoteRuntime;
pub use stub::StubRuntime;
pub use subprocess::SubprocessRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RuntimeError;

/// A single event emitted during a turn. Self-describing: `type` is the only
/// required field; everything else is optional so agent binaries can send
/// minimal frames.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AgentEvent {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Fill a missing timestamp; the hub expects every event stamped.
    pub fn ensure_timestamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }
}

/// One turn's worth of input for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnRequest {
    pub team: String,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    pub input: String,
    /// Outbound hosts the agent may reach; "*" means unrestricted.
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnResult {
    pub output: String,
}

/// Callback for intermediate events; invoked synchronously as they arrive.
pub type Emit<'a> = &'a (dyn Fn(AgentEvent) + Send + Sync);

/// The pluggable turn contract. Turns are single-shot; dropping the returned
/// future aborts the turn promptly (child killed, stream closed).
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_turn(&self, req: TurnRequest, emit: Emit<'_>) -> Result<TurnResult, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_event_wire_format() {
        let mut ev = AgentEvent::new("agent_activity");
        ev.team = Some("t1".into());
        ev.task_id = Some(3);
        ev.data = Some(serde_json::json!({"tool": "think"}));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"agent_activity\""));
        assert!(json.contains("\"task_id\":3"));
        assert!(!json.contains("\"agent\"")); // empty optionals omitted
    }

    #[test]
    fn test_agent_event_decodes_minimal_frame() {
        let ev: AgentEvent = serde_json::from_str(r#"{"type":"turn_started"}"#).unwrap();
        assert_eq!(ev.kind, "turn_started");
        assert!(ev.timestamp.is_none());
    }

    #[test]
    fn test_turn_request_omits_absent_task() {
        let req = TurnRequest {
            team: "t1".into(),
            agent: "alice".into(),
            input: "do things".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("task_id"));
        assert!(!json.contains("model"));
    }
}
