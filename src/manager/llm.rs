//! LLM-backed manager: replaces the rule core with a tool-calling loop
//! against an OpenAI-compatible chat-completion endpoint. The tool set
//! mirrors the rule-based reactor's control operations.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::MANAGER_RECIPIENT;
use crate::events::{ControlEvent, EventHub};
use crate::store::{StoreHandle, TaskStatus};

#[derive(Debug, Clone)]
pub struct LlmOpts {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

const SYSTEM_PROMPT: &str = "You are a manager agent. Use the provided tools to \
create/advance/assign tasks or reply to messages. Prefer brevity.";

/// Subscribe to the hub and drive manager decisions through the LLM.
/// Returns immediately when no endpoint is configured.
pub async fn run(
    store: StoreHandle,
    hub: Arc<EventHub>,
    opts: LlmOpts,
    mut shutdown: watch::Receiver<bool>,
) {
    if opts.api_key.is_empty() || opts.base_url.is_empty() {
        return;
    }
    let client = reqwest::Client::new();
    let mut sub = hub.subscribe();
    loop {
        let raw = tokio::select! {
            _ = shutdown.changed() => break,
            raw = sub.rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        let kind = payload.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if kind != "task_update" && kind != "message" {
            continue;
        }
        if let Err(e) = handle_event(&store, &hub, &client, &opts, &payload).await {
            warn!(err = %e, "llm manager turn failed");
        }
    }
    hub.unsubscribe(sub.id);
}

fn tool_definitions() -> serde_json::Value {
    serde_json::json!([
        {
            "type": "function",
            "function": {
                "name": "create_task",
                "description": "Create a new task in the team",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "team": {"type": "string", "description": "Team name"},
                        "title": {"type": "string", "description": "Task title"},
                        "status": {"type": "string", "description": "todo or in_progress"}
                    },
                    "required": ["team", "title"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "advance_task",
                "description": "Set task status (todo, in_progress, done, failed, cancelled)",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "integer"},
                        "status": {"type": "string"}
                    },
                    "required": ["task_id", "status"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "assign_task",
                "description": "Assign a task to an agent",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "integer"},
                        "assignee": {"type": "string"}
                    },
                    "required": ["task_id", "assignee"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "reply",
                "description": "Send a message reply to a recipient (e.g. human)",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "team": {"type": "string"},
                        "recipient": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["team", "recipient", "content"]
                }
            }
        }
    ])
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
    /// JSON-encoded argument object, per the chat-completions wire format.
    arguments: String,
}

async fn handle_event(
    store: &StoreHandle,
    hub: &Arc<EventHub>,
    client: &reqwest::Client,
    opts: &LlmOpts,
    payload: &serde_json::Value,
) -> Result<()> {
    let team = payload.get("team").and_then(|t| t.as_str()).unwrap_or("");
    if team.is_empty() {
        return Ok(());
    }
    let content = if payload.get("type").and_then(|t| t.as_str()) == Some("task_update") {
        format!(
            "Event: task_update team={} task_id={} status={}",
            team,
            payload.get("task_id").and_then(|v| v.as_i64()).unwrap_or(0),
            payload.get("status").and_then(|v| v.as_str()).unwrap_or(""),
        )
    } else {
        format!(
            "Event: message team={} from={} to={}",
            team,
            payload.get("from").and_then(|v| v.as_str()).unwrap_or(""),
            payload.get("to").and_then(|v| v.as_str()).unwrap_or(""),
        )
    };

    let body = serde_json::json!({
        "model": opts.model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": content},
        ],
        "tools": tool_definitions(),
        "tool_choice": "auto",
    });
    let url = format!("{}/v1/chat/completions", opts.base_url.trim_end_matches('/'));
    let resp = client
        .post(&url)
        .bearer_auth(&opts.api_key)
        .json(&body)
        .send()
        .await
        .context("chat completion request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("chat completion returned {}", resp.status());
    }
    let chat: ChatResponse = resp.json().await.context("bad chat completion body")?;

    let Some(choice) = chat.choices.first() else {
        return Ok(());
    };
    for call in &choice.message.tool_calls {
        let args: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_default();
        if let Err(e) = execute_tool(store, hub, &call.function.name, &args).await {
            warn!(tool = %call.function.name, err = %e, "manager tool call failed");
        }
    }
    Ok(())
}

async fn execute_tool(
    store: &StoreHandle,
    hub: &Arc<EventHub>,
    name: &str,
    args: &serde_json::Value,
) -> Result<()> {
    let text = |key: &str| args.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
    match name {
        "create_task" => {
            let (team, title) = (text("team"), text("title"));
            let status = TaskStatus::from_str(&text("status")).unwrap_or(TaskStatus::Todo);
            let id = store
                .call(move |s| {
                    let wf = s.workflow_id_by_name(&team, "default", 1)?;
                    s.create_task(&team, &title, status, wf.as_deref())
                })
                .await?;
            debug!(task_id = id, "llm manager created task");
        }
        "advance_task" => {
            let task_id = args.get("task_id").and_then(|v| v.as_i64()).unwrap_or(0);
            let Ok(status) = TaskStatus::from_str(&text("status")) else {
                return Ok(()); // unknown status, ignore rather than corrupt
            };
            store
                .call(move |s| s.set_task_status(task_id, status, None))
                .await?;
        }
        "assign_task" => {
            let task_id = args.get("task_id").and_then(|v| v.as_i64()).unwrap_or(0);
            let assignee = text("assignee");
            store
                .call(move |s| s.assign_task(task_id, Some(&assignee)))
                .await?;
        }
        "reply" => {
            let (team, recipient, content) = (text("team"), text("recipient"), text("content"));
            {
                let (team, recipient) = (team.clone(), recipient.clone());
                store
                    .call(move |s| {
                        s.create_message(&team, MANAGER_RECIPIENT, &recipient, &content)
                    })
                    .await?;
            }
            hub.publish_json(&ControlEvent::Message {
                team,
                from: MANAGER_RECIPIENT.to_string(),
                to: recipient,
            });
        }
        other => anyhow::bail!("unknown tool: {}", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn setup() -> (StoreHandle, Arc<EventHub>) {
        let store = Store::open_in_memory().unwrap();
        store.create_team("t1").unwrap();
        store.create_workflow("t1", "default", 1, "builtin").unwrap();
        (StoreHandle::new(store), Arc::new(EventHub::new()))
    }

    #[tokio::test]
    async fn test_create_task_tool() {
        let (store, hub) = setup().await;
        execute_tool(
            &store,
            &hub,
            "create_task",
            &serde_json::json!({"team": "t1", "title": "from llm"}),
        )
        .await
        .unwrap();
        let tasks = store.call(|s| s.list_tasks("t1", 0)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "from llm");
    }

    #[tokio::test]
    async fn test_advance_task_ignores_unknown_status() {
        let (store, hub) = setup().await;
        let id = store
            .call(|s| s.create_task("t1", "t", TaskStatus::Todo, None))
            .await
            .unwrap();
        execute_tool(
            &store,
            &hub,
            "advance_task",
            &serde_json::json!({"task_id": id, "status": "exploded"}),
        )
        .await
        .unwrap();
        let task = store
            .call(move |s| Ok(s.get_task("t1", id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_reply_tool_writes_message_and_publishes() {
        let (store, hub) = setup().await;
        let mut sub = hub.subscribe();
        execute_tool(
            &store,
            &hub,
            "reply",
            &serde_json::json!({"team": "t1", "recipient": "human", "content": "on it"}),
        )
        .await
        .unwrap();

        let messages = store
            .call(|s| s.list_messages("t1", "human", 0))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "on it");

        let _connected = sub.rx.recv().await.unwrap();
        let event = sub.rx.recv().await.unwrap();
        assert!(event.contains("\"message\""));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let (store, hub) = setup().await;
        assert!(execute_tool(&store, &hub, "launch_rockets", &serde_json::json!({}))
            .await
            .is_err());
    }

    #[test]
    fn test_tool_call_arguments_decode() {
        let raw = r#"{"choices":[{"message":{"tool_calls":[
            {"function":{"name":"create_task","arguments":"{\"team\":\"t1\",\"title\":\"x\"}"}}
        ]}}]}"#;
        let resp: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.choices[0].message.tool_calls[0].function.name, "create_task");
    }
}
