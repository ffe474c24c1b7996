//! Table-driven workflow engine: executes the current stage of a task and
//! applies the outcome's transition. Behavior is determined entirely by the
//! workflow's stage and transition tables.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::gitops;
use crate::memory;
use crate::runtime::{AgentRuntime, Emit, TurnRequest};
use crate::store::{StageType, StoreHandle, Task, TaskStatus, WorkflowStage};

pub struct Engine {
    store: StoreHandle,
    /// When set, per-agent config is loaded and journals are appended under
    /// this home directory; also the root for lazily created worktrees.
    home: Option<PathBuf>,
}

impl Engine {
    pub fn new(store: StoreHandle, home: Option<PathBuf>) -> Self {
        Self { store, home }
    }

    /// Run one workflow turn for the task. Returns Ok(false) when the task
    /// has no workflow attached, so the caller can fall back to the plain
    /// single-turn flow. Errors are returned without marking the task; the
    /// scheduler owns failure bookkeeping.
    pub async fn run_turn(
        &self,
        team_name: &str,
        task: &Task,
        runtime: &dyn AgentRuntime,
        emit: Emit<'_>,
    ) -> Result<bool> {
        let Some(wf_id) = task.workflow_id.clone().filter(|w| !w.is_empty()) else {
            return Ok(false);
        };

        let mut stage_name = task.current_stage.clone().unwrap_or_default();
        if stage_name.is_empty() {
            let wf = wf_id.clone();
            stage_name = self.store.call(move |s| s.initial_stage(&wf)).await?;
            let (wf, stage, id) = (wf_id.clone(), stage_name.clone(), task.task_id);
            self.store
                .call(move |s| s.set_task_workflow_and_stage(id, &wf, &stage))
                .await?;
        }

        let stages = {
            let wf = wf_id.clone();
            self.store.call(move |s| s.get_workflow_stages(&wf)).await?
        };
        let Some(stage) = stages.iter().find(|s| s.stage_name == stage_name) else {
            // Stage not in the table; nothing to dispatch.
            return Ok(true);
        };

        match stage.stage_type {
            StageType::Terminal => {
                let id = task.task_id;
                self.store
                    .call(move |s| s.set_task_status(id, TaskStatus::Done, None))
                    .await?;
                Ok(true)
            }
            StageType::Human => Ok(true),
            StageType::Auto => {
                self.advance(&wf_id, task.task_id, &stage_name, "done", &stages)
                    .await?;
                Ok(true)
            }
            StageType::Agent => {
                self.run_agent_stage(team_name, task, &wf_id, &stage_name, &stages, runtime, emit)
                    .await
            }
            StageType::Merge => {
                self.run_merge_stage(team_name, task).await?;
                self.advance(&wf_id, task.task_id, &stage_name, "done", &stages)
                    .await?;
                Ok(true)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_agent_stage(
        &self,
        team_name: &str,
        task: &Task,
        wf_id: &str,
        stage_name: &str,
        stages: &[WorkflowStage],
        runtime: &dyn AgentRuntime,
        emit: Emit<'_>,
    ) -> Result<bool> {
        let agent_name = task.assignee.clone().unwrap_or_default();
        self.ensure_worktree(team_name, task).await?;

        let allowlist = self.store.call(|s| s.list_allowed_domains()).await?;
        let mut req = TurnRequest {
            team: team_name.to_string(),
            agent: agent_name.clone(),
            task_id: Some(task.task_id),
            input: task.title.clone(),
            network_allowlist: allowlist,
            model: None,
            max_tokens: None,
        };
        if let (Some(home), false) = (&self.home, agent_name.is_empty()) {
            let team_dir = memory::team_dir(home, team_name);
            let agent_dir = memory::agent_dir(&team_dir, &agent_name);
            if let Ok(Some(cfg)) = memory::load_agent_config(&agent_dir) {
                req.model = cfg.model;
                req.max_tokens = cfg.max_tokens;
            }
        }

        let result = runtime
            .run_turn(req, emit)
            .await
            .context("agent turn failed")?;

        let mut outcome = result.output.trim().to_string();
        if outcome.is_empty() || outcome == "stub: ok" {
            outcome = "done".to_string();
        }

        if let (Some(home), false) = (&self.home, agent_name.is_empty()) {
            let team_dir = memory::team_dir(home, team_name);
            let _ = memory::append_journal(
                &team_dir,
                &agent_name,
                &memory::JournalEntry {
                    task_id: task.task_id,
                    task_title: task.title.clone(),
                    outcome: outcome.clone(),
                    created_at: None,
                },
            );
        }
        self.advance(wf_id, task.task_id, stage_name, &outcome, stages)
            .await?;
        Ok(true)
    }

    /// Merge-type stage reached directly by the scheduler: run the repo's
    /// tests in the worktree, then integrate the branch into the main line.
    async fn run_merge_stage(&self, team_name: &str, task: &Task) -> Result<()> {
        let Some(worktree) = task.worktree_path.clone().filter(|w| !w.is_empty()) else {
            return Ok(());
        };
        let worktree = PathBuf::from(worktree);

        let repos = {
            let team = team_name.to_string();
            self.store.call(move |s| s.list_repos(&team)).await?
        };
        let repo = repos
            .iter()
            .find(|r| task.repo_name.as_deref() == Some(r.name.as_str()))
            .or_else(|| repos.first());
        if let Some(test_cmd) = repo.and_then(|r| r.test_cmd.as_deref()) {
            gitops::run_test_cmd(&worktree, test_cmd).await?;
        }
        if let Some(branch) = task.branch_name.as_deref().filter(|b| !b.is_empty()) {
            gitops::merge_in_worktree(&worktree, branch)
                .await
                .context("merge failed")?;
        }
        Ok(())
    }

    /// Create the task's worktree on first need: the task is entering an
    /// agent stage, has no worktree yet, and its team has a repo to work in.
    async fn ensure_worktree(&self, team_name: &str, task: &Task) -> Result<Option<PathBuf>> {
        if let Some(existing) = task.worktree_path.clone().filter(|w| !w.is_empty()) {
            return Ok(Some(PathBuf::from(existing)));
        }
        let Some(home) = &self.home else {
            return Ok(None);
        };
        let (team, repos) = {
            let name = team_name.to_string();
            self.store
                .call(move |s| Ok((s.get_team(&name)?, s.list_repos(&name)?)))
                .await?
        };
        let repo = repos
            .iter()
            .find(|r| task.repo_name.as_deref() == Some(r.name.as_str()))
            .or_else(|| repos.first());
        let Some(repo) = repo else {
            return Ok(None);
        };

        let branch = gitops::branch_name(&team.team_id, team_name, task.task_id);
        let path = gitops::worktree_path(home, team_name, &repo.name, task.task_id);
        let base_sha = gitops::create_worktree(&path, &repo.source, &branch)
            .await
            .context("worktree creation failed")?;

        let (id, wt, br, sha, repo_name) = (
            task.task_id,
            path.display().to_string(),
            branch,
            base_sha,
            repo.name.clone(),
        );
        self.store
            .call(move |s| {
                s.set_task_git_fields(id, Some(&wt), Some(&br), Some(&sha), Some(&repo_name))
            })
            .await?;
        Ok(Some(path))
    }

    /// Apply the transition for (stage, outcome). A missing transition is not
    /// an error: the task stays where it is. Reaching a terminal stage also
    /// flips the summary status to done.
    async fn advance(
        &self,
        wf_id: &str,
        task_id: i64,
        from_stage: &str,
        outcome: &str,
        stages: &[WorkflowStage],
    ) -> Result<()> {
        let next = {
            let (wf, from, out) = (wf_id.to_string(), from_stage.to_string(), outcome.to_string());
            self.store
                .call(move |s| {
                    Ok(s.get_workflow_transitions(&wf)?
                        .into_iter()
                        .find(|t| t.from_stage == from && t.outcome == out)
                        .map(|t| t.to_stage))
                })
                .await?
        };
        let Some(next) = next else {
            return Ok(());
        };
        {
            let stage = next.clone();
            self.store
                .call(move |s| s.update_task_stage(task_id, &stage))
                .await?;
        }
        let terminal = stages
            .iter()
            .any(|s| s.stage_name == next && s.stage_type == StageType::Terminal);
        if terminal {
            self.store
                .call(move |s| s.set_task_status(task_id, TaskStatus::Done, None))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::StubRuntime;
    use crate::store::Store;

    async fn setup() -> (StoreHandle, String) {
        let store = Store::open_in_memory().unwrap();
        store.create_team("t1").unwrap();
        store.create_agent("t1", "alice", "engineer").unwrap();
        let wf = store.create_workflow("t1", "default", 1, "builtin").unwrap();
        (StoreHandle::new(store), wf)
    }

    async fn get(store: &StoreHandle, id: i64) -> Task {
        store
            .call(move |s| Ok(s.get_task("t1", id)?.unwrap()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_workflow_is_not_handled() {
        let (store, _) = setup().await;
        let id = store
            .call(|s| s.create_task("t1", "t", TaskStatus::Todo, None))
            .await
            .unwrap();
        let task = get(&store, id).await;
        let engine = Engine::new(store, None);
        let handled = engine
            .run_turn("t1", &task, &StubRuntime, &|_| {})
            .await
            .unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_agent_stage_follows_done_transition_to_terminal() {
        let (store, wf) = setup().await;
        let wf2 = wf.clone();
        let id = store
            .call(move |s| s.create_task("t1", "t", TaskStatus::Todo, Some(&wf2)))
            .await
            .unwrap();
        store
            .call(move |s| {
                s.claim_task("t1", id, "alice")?;
                Ok(())
            })
            .await
            .unwrap();

        let task = get(&store, id).await;
        assert_eq!(task.current_stage.as_deref(), Some("Coding"));

        let engine = Engine::new(store.clone(), None);
        // Stub output "stub: ok" normalizes to "done"; (Coding, done) -> Done.
        let handled = engine
            .run_turn("t1", &task, &StubRuntime, &|_| {})
            .await
            .unwrap();
        assert!(handled);

        let task = get(&store, id).await;
        assert_eq!(task.current_stage.as_deref(), Some("Done"));
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_missing_transition_keeps_stage() {
        let (store, wf) = setup().await;
        let wf2 = wf.clone();
        let id = store
            .call(move |s| s.create_task("t1", "t", TaskStatus::Todo, Some(&wf2)))
            .await
            .unwrap();
        // Park the task in InReview, where no (InReview, done) row exists.
        let wf3 = wf.clone();
        store
            .call(move |s| s.set_task_workflow_and_stage(id, &wf3, "InReview"))
            .await
            .unwrap();

        let task = get(&store, id).await;
        let engine = Engine::new(store.clone(), None);
        engine
            .run_turn("t1", &task, &StubRuntime, &|_| {})
            .await
            .unwrap();

        let task = get(&store, id).await;
        assert_eq!(task.current_stage.as_deref(), Some("InReview"));
    }

    #[tokio::test]
    async fn test_terminal_stage_marks_done() {
        let (store, wf) = setup().await;
        let wf2 = wf.clone();
        let id = store
            .call(move |s| s.create_task("t1", "t", TaskStatus::Todo, Some(&wf2)))
            .await
            .unwrap();
        let wf3 = wf.clone();
        store
            .call(move |s| s.set_task_workflow_and_stage(id, &wf3, "Done"))
            .await
            .unwrap();

        let task = get(&store, id).await;
        let engine = Engine::new(store.clone(), None);
        engine
            .run_turn("t1", &task, &StubRuntime, &|_| {})
            .await
            .unwrap();
        assert_eq!(get(&store, id).await.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_workflow_with_only_terminal_stage_finishes_in_one_turn() {
        let (store, _) = setup().await;
        let wf = store
            .call(|s| {
                s.create_workflow_with_stages(
                    "t1",
                    "instant",
                    1,
                    "builtin",
                    &[WorkflowStage {
                        workflow_id: String::new(),
                        stage_name: "Done".into(),
                        stage_type: StageType::Terminal,
                        outcomes: String::new(),
                        candidate_agents: String::new(),
                    }],
                    &[],
                )
            })
            .await
            .unwrap();
        let wf2 = wf.clone();
        let id = store
            .call(move |s| s.create_task("t1", "t", TaskStatus::Todo, Some(&wf2)))
            .await
            .unwrap();

        let task = get(&store, id).await;
        let engine = Engine::new(store.clone(), None);
        engine
            .run_turn("t1", &task, &StubRuntime, &|_| {})
            .await
            .unwrap();
        assert_eq!(get(&store, id).await.status, TaskStatus::Done);
    }
}
