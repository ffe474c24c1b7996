use std::time::Duration;

use async_trait::async_trait;

use super::{AgentEvent, AgentRuntime, Emit, TurnRequest, TurnResult};
use crate::errors::RuntimeError;

/// Deterministic in-process runtime: emits a fixed three-event sequence with
/// brief pacing and always reports success. Used for demos and tests, and as
/// the default backend when no subprocess or remote endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubRuntime;

const PACING: Duration = Duration::from_millis(150);

#[async_trait]
impl AgentRuntime for StubRuntime {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn run_turn(&self, req: TurnRequest, emit: Emit<'_>) -> Result<TurnResult, RuntimeError> {
        let base = |kind: &str| {
            let mut ev = AgentEvent::new(kind);
            ev.team = Some(req.team.clone());
            ev.agent = Some(req.agent.clone());
            ev.task_id = req.task_id;
            ev
        };

        let mut started = base("turn_started");
        started.data = Some(serde_json::json!({"sender": "system"}));
        emit(started);

        tokio::time::sleep(PACING).await;
        let mut activity = base("agent_activity");
        activity.data = Some(serde_json::json!({
            "tool": "think",
            "summary": "Stub runtime simulated a turn",
        }));
        emit(activity);

        tokio::time::sleep(PACING).await;
        emit(base("turn_ended"));

        Ok(TurnResult {
            output: "stub: ok".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_stub_emits_three_events_and_succeeds() {
        let events: Mutex<Vec<AgentEvent>> = Mutex::new(Vec::new());
        let req = TurnRequest {
            team: "t1".into(),
            agent: "alice".into(),
            task_id: Some(1),
            input: "t".into(),
            ..Default::default()
        };

        let result = StubRuntime
            .run_turn(req, &|ev| events.lock().unwrap().push(ev))
            .await
            .unwrap();

        assert_eq!(result.output, "stub: ok");
        let events = events.into_inner().unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["turn_started", "agent_activity", "turn_ended"]);
        assert!(events.iter().all(|e| e.timestamp.is_some()));
        assert_eq!(events[0].agent.as_deref(), Some("alice"));
    }
}
