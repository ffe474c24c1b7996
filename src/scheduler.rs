//! Periodic per-team dispatcher. Each tick picks the oldest runnable task
//! per team, chooses an assignee, and hands the turn to a worker under a
//! global concurrency semaphore. Claim-or-abort keeps turn ownership
//! exclusive; workers are not awaited before the next tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, warn};

use crate::events::{ControlEvent, EventHub};
use crate::review;
use crate::runtime::{AgentEvent, AgentRuntime, TurnRequest};
use crate::store::{Agent, StoreHandle, Task, TaskStatus};
use crate::workflow::Engine;

pub struct Scheduler {
    store: StoreHandle,
    hub: Arc<EventHub>,
    runtime: Arc<dyn AgentRuntime>,
    engine: Arc<Engine>,
    tick: Duration,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        store: StoreHandle,
        hub: Arc<EventHub>,
        runtime: Arc<dyn AgentRuntime>,
        home: Option<PathBuf>,
        tick: Duration,
        max_concurrent: usize,
    ) -> Self {
        let engine = Arc::new(Engine::new(store.clone(), home));
        Self {
            store,
            hub,
            runtime,
            engine,
            tick,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run until shutdown is signalled. Transient store errors are logged and
    /// the loop continues with the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }
            self.clone().tick_once(&mut shutdown).await;
        }
    }

    async fn tick_once(self: Arc<Self>, shutdown: &mut watch::Receiver<bool>) {
        let teams = match self.store.call(|s| s.list_teams()).await {
            Ok(teams) => teams,
            Err(e) => {
                error!(err = %e, "scheduler failed to list teams");
                return;
            }
        };

        for team in teams {
            let team_name = team.name.clone();
            let task = {
                let name = team_name.clone();
                match self.store.call(move |s| s.next_runnable_task(&name)).await {
                    Ok(Some(task)) => task,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(team = %team_name, err = %e, "scheduler next-runnable query failed");
                        continue;
                    }
                }
            };
            let agents = {
                let name = team_name.clone();
                match self.store.call(move |s| s.list_agents(&name)).await {
                    Ok(agents) if !agents.is_empty() => agents,
                    _ => continue, // no agents, skip team without error
                }
            };
            let Some(assignee) = pick_assignee(&self.store, &task, &agents).await else {
                debug!(team = %team_name, task_id = task.task_id, "candidate pool empty, skipping");
                continue;
            };

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = shutdown.changed() => return,
            };

            let sched = self.clone();
            tokio::spawn(async move {
                let _slot = permit; // released on every exit path, panics included
                sched.run_claimed_turn(&team_name, task, assignee, agents).await;
            });
        }
    }

    /// Claim the task and run exactly one turn. A lost claim is silent; the
    /// other worker owns the turn.
    async fn run_claimed_turn(
        &self,
        team_name: &str,
        task: Task,
        assignee: String,
        agents: Vec<Agent>,
    ) {
        let claimed = {
            let (team, who) = (team_name.to_string(), assignee.clone());
            let id = task.task_id;
            match self.store.call(move |s| s.claim_task(&team, id, &who)).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(task_id = task.task_id, err = %e, "claim failed");
                    return;
                }
            }
        };
        if !claimed {
            return; // another worker won the race
        }
        self.hub.publish_json(
            &ControlEvent::task_update(team_name, task.task_id)
                .with_status(TaskStatus::InProgress.as_str())
                .with_assignee(&assignee),
        );

        let hub = self.hub.clone();
        let emit = move |mut ev: AgentEvent| {
            ev.ensure_timestamp();
            hub.publish_json(&ev);
        };

        match self
            .engine
            .run_turn(team_name, &task, self.runtime.as_ref(), &emit)
            .await
        {
            Ok(true) => self.finish_workflow_turn(team_name, task.task_id, agents).await,
            Ok(false) => {
                // No workflow attached: one plain turn, then done.
                self.run_plain_turn(team_name, &task, &assignee, &emit).await;
            }
            Err(e) => {
                self.fail_turn(team_name, task.task_id, &assignee, &e.to_string())
                    .await;
            }
        }
    }

    /// After a handled workflow turn: assign a reviewer when the task just
    /// entered the review stage, then mirror the final state to the hub.
    async fn finish_workflow_turn(&self, team_name: &str, task_id: i64, agents: Vec<Agent>) {
        let updated = {
            let team = team_name.to_string();
            match self.store.call(move |s| s.get_task(&team, task_id)).await {
                Ok(Some(task)) => task,
                _ => return,
            }
        };
        let mut assignee = updated.assignee.clone();
        if updated.current_stage.as_deref() == Some(review::IN_REVIEW_STAGE) && !agents.is_empty() {
            if let Some(reviewer) = review::pick_reviewer(&self.store, &updated, &agents).await {
                let who = reviewer.clone();
                let _ = self
                    .store
                    .call(move |s| s.assign_task(task_id, Some(&who)))
                    .await;
                assignee = Some(reviewer);
            }
        }

        let mut event = ControlEvent::task_update(team_name, task_id)
            .with_status(updated.status.as_str());
        if let Some(a) = &assignee {
            event = event.with_assignee(a);
        }
        if let Some(stage) = &updated.current_stage {
            event = event.with_stage(stage);
        }
        self.hub.publish_json(&event);
    }

    async fn run_plain_turn(
        &self,
        team_name: &str,
        task: &Task,
        assignee: &str,
        emit: &(dyn Fn(AgentEvent) + Send + Sync),
    ) {
        let allowlist = self
            .store
            .call(|s| s.list_allowed_domains())
            .await
            .unwrap_or_default();
        let req = TurnRequest {
            team: team_name.to_string(),
            agent: assignee.to_string(),
            task_id: Some(task.task_id),
            input: task.title.clone(),
            network_allowlist: allowlist,
            model: None,
            max_tokens: None,
        };
        match self.runtime.run_turn(req, emit).await {
            Ok(_) => {
                let id = task.task_id;
                if let Err(e) = self
                    .store
                    .call(move |s| s.set_task_status(id, TaskStatus::Done, None))
                    .await
                {
                    error!(task_id = id, err = %e, "failed to mark task done");
                    return;
                }
                self.hub.publish_json(
                    &ControlEvent::task_update(team_name, task.task_id)
                        .with_status(TaskStatus::Done.as_str()),
                );
            }
            Err(e) => {
                self.fail_turn(team_name, task.task_id, assignee, &e.to_string())
                    .await;
            }
        }
    }

    /// Runtime failure: mark failed (attempt counted), surface the error as
    /// an activity event, and report the status change. No automatic retry.
    async fn fail_turn(&self, team_name: &str, task_id: i64, agent: &str, error: &str) {
        if let Err(e) = self.store.call(move |s| s.set_task_failed(task_id)).await {
            error!(task_id, err = %e, "failed to mark task failed");
        }
        let mut ev = AgentEvent::new("agent_activity");
        ev.team = Some(team_name.to_string());
        ev.agent = Some(agent.to_string());
        ev.task_id = Some(task_id);
        ev.data = Some(serde_json::json!({"tool": "error", "error": error}));
        self.hub.publish_json(&ev);
        self.hub.publish_json(
            &ControlEvent::task_update(team_name, task_id).with_status(TaskStatus::Failed.as_str()),
        );
    }
}

/// Choose the assignee for a task. A workflow stage with a candidate pool
/// restricts the choice to pool members; within the eligible set a manager is
/// preferred, then insertion order. Returns None when the pool excludes every
/// agent; the task is skipped this tick.
pub async fn pick_assignee(
    store: &StoreHandle,
    task: &Task,
    agents: &[Agent],
) -> Option<String> {
    if let (Some(wf_id), Some(stage_name)) = (
        task.workflow_id.clone().filter(|w| !w.is_empty()),
        task.current_stage.clone().filter(|s| !s.is_empty()),
    ) {
        let stages = store
            .call(move |s| s.get_workflow_stages(&wf_id))
            .await
            .unwrap_or_default();
        if let Some(stage) = stages.iter().find(|s| s.stage_name == stage_name) {
            let pool = stage.candidate_pool();
            if !pool.is_empty() {
                let candidates: Vec<&Agent> =
                    agents.iter().filter(|a| pool.contains(&a.name)).collect();
                if candidates.is_empty() {
                    return None;
                }
                if let Some(manager) = candidates.iter().find(|a| a.is_manager()) {
                    return Some(manager.name.clone());
                }
                return Some(candidates[0].name.clone());
            }
        }
    }
    agents
        .iter()
        .find(|a| a.is_manager())
        .or_else(|| agents.first())
        .map(|a| a.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, WorkflowStage, WorkflowTransition};

    fn agents(names: &[(&str, &str)]) -> Vec<Agent> {
        names
            .iter()
            .map(|(name, role)| Agent {
                name: name.to_string(),
                role: role.to_string(),
                created_at: chrono::Utc::now(),
            })
            .collect()
    }

    fn bare_task() -> Task {
        Task {
            task_id: 1,
            title: "t".into(),
            status: TaskStatus::Todo,
            assignee: None,
            dri: None,
            attempt_count: 0,
            workflow_id: None,
            current_stage: None,
            worktree_path: None,
            branch_name: None,
            base_sha: None,
            repo_name: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_manager_preferred_over_insertion_order() {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let picked = pick_assignee(
            &store,
            &bare_task(),
            &agents(&[("alice", "engineer"), ("bob", "manager"), ("carol", "engineer")]),
        )
        .await;
        assert_eq!(picked.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_first_agent_when_no_manager() {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let picked = pick_assignee(
            &store,
            &bare_task(),
            &agents(&[("alice", "engineer"), ("carol", "engineer")]),
        )
        .await;
        assert_eq!(picked.as_deref(), Some("alice"));
    }

    async fn pooled_workflow(store: &Store, pool: &str) -> String {
        store
            .create_workflow_with_stages(
                "t1",
                "pooled",
                1,
                "builtin",
                &[
                    WorkflowStage {
                        workflow_id: String::new(),
                        stage_name: "InProgress".into(),
                        stage_type: crate::store::StageType::Agent,
                        outcomes: "done".into(),
                        candidate_agents: pool.into(),
                    },
                    WorkflowStage {
                        workflow_id: String::new(),
                        stage_name: "Done".into(),
                        stage_type: crate::store::StageType::Terminal,
                        outcomes: String::new(),
                        candidate_agents: String::new(),
                    },
                ],
                &[WorkflowTransition {
                    workflow_id: String::new(),
                    from_stage: "InProgress".into(),
                    outcome: "done".into(),
                    to_stage: "Done".into(),
                }],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_candidate_pool_prefers_manager_inside_pool() {
        let store = Store::open_in_memory().unwrap();
        store.create_team("t1").unwrap();
        let wf = pooled_workflow(&store, "alice,bob,carol").await;
        let mut task = bare_task();
        task.workflow_id = Some(wf);
        task.current_stage = Some("InProgress".into());
        let store = StoreHandle::new(store);

        let picked = pick_assignee(
            &store,
            &task,
            &agents(&[("alice", "engineer"), ("bob", "manager"), ("carol", "engineer")]),
        )
        .await;
        assert_eq!(picked.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_candidate_pool_excluding_everyone_skips_task() {
        let store = Store::open_in_memory().unwrap();
        store.create_team("t1").unwrap();
        let wf = pooled_workflow(&store, "nobody").await;
        let mut task = bare_task();
        task.workflow_id = Some(wf);
        task.current_stage = Some("InProgress".into());
        let store = StoreHandle::new(store);

        let picked = pick_assignee(
            &store,
            &task,
            &agents(&[("alice", "engineer"), ("bob", "manager")]),
        )
        .await;
        assert!(picked.is_none());
    }
}
