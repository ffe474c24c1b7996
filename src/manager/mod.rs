//! Manager reactor: a rule-based loop that consumes hub events and the
//! "manager" message inbox, and writes control operations back to the store.
//! Reaction is limited to a fixed rule set; writes never block the publish
//! path (the reactor is an ordinary hub subscriber).

pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::{ControlEvent, EventHub};
use crate::sandbox;
use crate::store::{Message, StoreHandle, TaskStatus};

pub const MANAGER_RECIPIENT: &str = "manager";
pub const INBOX_POLL_INTERVAL: Duration = Duration::from_secs(5);

const FOLLOW_UP_PREFIX: &str = "Review: ";
const INBOX_BATCH: i64 = 10;

/// Subscribe to the hub and react to task lifecycle events until shutdown.
pub async fn run(store: StoreHandle, hub: Arc<EventHub>, mut shutdown: watch::Receiver<bool>) {
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
        handle_event(&store, &hub, &payload).await;
    }
    hub.unsubscribe(sub.id);
}

async fn handle_event(store: &StoreHandle, hub: &Arc<EventHub>, payload: &serde_json::Value) {
    if payload.get("type").and_then(|t| t.as_str()) != Some("task_update") {
        return;
    }
    let Some(team) = payload.get("team").and_then(|t| t.as_str()) else {
        return;
    };
    let Some(task_id) = payload.get("task_id").and_then(|id| id.as_i64()) else {
        return;
    };
    let status = payload.get("status").and_then(|s| s.as_str()).unwrap_or("");

    match status {
        "done" => {
            let task = {
                let team = team.to_string();
                match store.call(move |s| s.get_task(&team, task_id)).await {
                    Ok(Some(task)) => task,
                    _ => return,
                }
            };
            if task.workflow_id.is_none() {
                return;
            }
            // One level of follow-up only: reviewing a review task would
            // chain forever.
            if task.title.starts_with(FOLLOW_UP_PREFIX) {
                return;
            }
            let title = format!("{}{}", FOLLOW_UP_PREFIX, task.title);
            match create_task_for_team(store, team, &title).await {
                Ok(id) => {
                    info!(team, task_id = id, %title, "manager created follow-up review task");
                    hub.publish_json(&ControlEvent::task_update(team, id));
                }
                Err(e) => warn!(team, err = %e, "manager follow-up task creation failed"),
            }
        }
        "failed" => {
            // No automatic action; requeue is a deliberate operator move.
        }
        _ => {}
    }
}

/// Create a task under the team's default workflow (when one exists).
pub async fn create_task_for_team(store: &StoreHandle, team: &str, title: &str) -> Result<i64> {
    let (team, title) = (team.to_string(), title.to_string());
    store
        .call(move |s| {
            let wf = s.workflow_id_by_name(&team, "default", 1)?;
            s.create_task(&team, &title, TaskStatus::Todo, wf.as_deref())
        })
        .await
}

/// Poll the manager inbox on a fixed cadence, handling each unprocessed
/// message in arrival order and marking it processed afterwards.
pub async fn poll_inbox(
    store: StoreHandle,
    hub: Arc<EventHub>,
    recipient: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let recipient = if recipient.is_empty() {
        MANAGER_RECIPIENT.to_string()
    } else {
        recipient
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        let teams = match store.call(|s| s.list_teams()).await {
            Ok(teams) => teams,
            Err(_) => continue,
        };
        for team in teams {
            let messages = {
                let (name, rcpt) = (team.name.clone(), recipient.clone());
                match store
                    .call(move |s| s.list_unprocessed_messages(&name, &rcpt, INBOX_BATCH))
                    .await
                {
                    Ok(messages) => messages,
                    Err(_) => continue,
                }
            };
            for message in messages {
                let id = message.message_id;
                handle_inbox_message(&store, &hub, &team.name, &message).await;
                let _ = store.call(move |s| s.mark_message_processed(id)).await;
            }
        }
    }
}

pub async fn handle_inbox_message(
    store: &StoreHandle,
    hub: &Arc<EventHub>,
    team: &str,
    message: &Message,
) {
    let content = message.content.trim();

    if let Some(cmd_line) = content.strip_prefix("/shell ") {
        let cmd_line = cmd_line.trim();
        if cmd_line.is_empty() {
            reply(store, hub, team, &message.sender, "usage: /shell <command>").await;
            return;
        }
        if sandbox::blocked_shell_command(cmd_line) {
            reply(store, hub, team, &message.sender, "error: command not allowed").await;
            return;
        }
        let body = match run_shell_command(cmd_line).await {
            Ok(output) => output,
            Err(e) => format!("error: {}", e),
        };
        reply(store, hub, team, &message.sender, &body).await;
        return;
    }

    // Non-trivial content becomes a task; everything else gets an ack.
    let body = if content.len() > 10 && !content.starts_with('/') {
        match create_task_for_team(store, team, content).await {
            Ok(id) => {
                info!(team, task_id = id, from = %message.sender, "manager created task from message");
                format!("Created task #{}", id)
            }
            Err(_) => format!("Got: {}", content),
        }
    } else {
        format!("Got: {}", content)
    };
    reply(store, hub, team, &message.sender, &body).await;
}

async fn reply(store: &StoreHandle, hub: &Arc<EventHub>, team: &str, sender: &str, body: &str) {
    {
        let (team, sender, body) = (team.to_string(), sender.to_string(), body.to_string());
        let _ = store
            .call(move |s| s.create_message(&team, MANAGER_RECIPIENT, &sender, &body))
            .await;
    }
    hub.publish_json(&ControlEvent::Message {
        team: team.to_string(),
        from: MANAGER_RECIPIENT.to_string(),
        to: sender.to_string(),
    });
}

async fn run_shell_command(cmd_line: &str) -> Result<String> {
    let output = tokio::process::Command::new("sh")
        .args(["-c", cmd_line])
        .output()
        .await?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        anyhow::bail!("{}", combined.trim());
    }
    Ok(combined.trim().to_string())
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

    async fn last_reply(store: &StoreHandle, to: &str) -> String {
        let to = to.to_string();
        store
            .call(move |s| Ok(s.list_messages("t1", &to, 1)?))
            .await
            .unwrap()
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn inbox_message(content: &str) -> Message {
        Message {
            message_id: 1,
            sender: "human".into(),
            recipient: MANAGER_RECIPIENT.into(),
            content: content.into(),
            created_at: chrono::Utc::now(),
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn test_long_message_creates_task() {
        let (store, hub) = setup().await;
        handle_inbox_message(&store, &hub, "t1", &inbox_message("Please fix the login page"))
            .await;

        let tasks = store.call(|s| s.list_tasks("t1", 0)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Please fix the login page");
        // The task landed on the default workflow's initial stage.
        assert_eq!(tasks[0].current_stage.as_deref(), Some("Coding"));
        assert!(last_reply(&store, "human").await.starts_with("Created task #"));
    }

    #[tokio::test]
    async fn test_short_message_gets_ack() {
        let (store, hub) = setup().await;
        handle_inbox_message(&store, &hub, "t1", &inbox_message("hi")).await;
        assert_eq!(last_reply(&store, "human").await, "Got: hi");
        assert!(store.call(|s| s.list_tasks("t1", 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slash_prefixed_message_is_not_a_task() {
        let (store, hub) = setup().await;
        handle_inbox_message(&store, &hub, "t1", &inbox_message("/unknown command here")).await;
        assert!(store.call(|s| s.list_tasks("t1", 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shell_command_runs_and_replies() {
        let (store, hub) = setup().await;
        handle_inbox_message(&store, &hub, "t1", &inbox_message("/shell echo hello")).await;
        assert_eq!(last_reply(&store, "human").await, "hello");
    }

    #[tokio::test]
    async fn test_denied_shell_command_is_refused() {
        let (store, hub) = setup().await;
        handle_inbox_message(&store, &hub, "t1", &inbox_message("/shell rm -rf .git")).await;
        assert_eq!(last_reply(&store, "human").await, "error: command not allowed");
    }

    #[tokio::test]
    async fn test_done_event_creates_follow_up_review_task() {
        let (store, hub) = setup().await;
        let id = store
            .call(|s| {
                let wf = s.workflow_id_by_name("t1", "default", 1)?.unwrap();
                s.create_task("t1", "Ship the feature", TaskStatus::Todo, Some(&wf))
            })
            .await
            .unwrap();

        let payload = serde_json::json!({
            "type": "task_update", "team": "t1", "task_id": id, "status": "done",
        });
        handle_event(&store, &hub, &payload).await;

        let tasks = store.call(|s| s.list_tasks("t1", 0)).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().any(|t| t.title == "Review: Ship the feature"));
    }

    #[tokio::test]
    async fn test_follow_up_of_follow_up_is_suppressed() {
        let (store, hub) = setup().await;
        let id = store
            .call(|s| {
                let wf = s.workflow_id_by_name("t1", "default", 1)?.unwrap();
                s.create_task("t1", "Review: Ship the feature", TaskStatus::Todo, Some(&wf))
            })
            .await
            .unwrap();

        let payload = serde_json::json!({
            "type": "task_update", "team": "t1", "task_id": id, "status": "done",
        });
        handle_event(&store, &hub, &payload).await;

        assert_eq!(store.call(|s| s.list_tasks("t1", 0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_event_takes_no_action() {
        let (store, hub) = setup().await;
        let id = store
            .call(|s| s.create_task("t1", "t", TaskStatus::Todo, None))
            .await
            .unwrap();
        store.call(move |s| s.set_task_failed(id)).await.unwrap();

        let payload = serde_json::json!({
            "type": "task_update", "team": "t1", "task_id": id, "status": "failed",
        });
        handle_event(&store, &hub, &payload).await;

        let task = store
            .call(move |s| Ok(s.get_task("t1", id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(store.call(|s| s.list_tasks("t1", 0)).await.unwrap().len(), 1);
    }
}
