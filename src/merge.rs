//! Merge worker: a slow periodic loop that drains tasks parked in the
//! "Merging" stage. Per task: rebase (optional) -> test -> merge -> finalize.
//! Any failing step marks the task failed and leaves the worktree in place
//! for inspection; cleanup happens only on success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::errors::MergeError;
use crate::events::{ControlEvent, EventHub};
use crate::gitops;
use crate::store::{StoreHandle, Task, TaskStatus, MERGING_STAGE};

const STAGE_BATCH: i64 = 20;

pub struct MergeWorker {
    pub store: StoreHandle,
    pub hub: Arc<EventHub>,
    pub interval: Duration,
    pub rebase_before_merge: bool,
}

impl MergeWorker {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }
            self.run_once().await;
        }
    }

    /// One pass over every team's Merging stage. Tasks are processed
    /// serially; the tick lists once, so the worker never runs concurrently
    /// on the same task.
    pub async fn run_once(&self) {
        let teams = match self.store.call(|s| s.list_teams()).await {
            Ok(teams) => teams,
            Err(e) => {
                error!(err = %e, "merge worker failed to list teams");
                return;
            }
        };
        for team in teams {
            let tasks = {
                let name = team.name.clone();
                match self
                    .store
                    .call(move |s| s.list_tasks_in_stage(&name, MERGING_STAGE, STAGE_BATCH))
                    .await
                {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        warn!(team = %team.name, err = %e, "merge worker stage listing failed");
                        continue;
                    }
                }
            };
            for task in tasks {
                if let Err(e) = self.process_task(&team.name, &task).await {
                    warn!(team = %team.name, task_id = task.task_id, err = %e, "merge pipeline failed");
                    let id = task.task_id;
                    let _ = self.store.call(move |s| s.set_task_failed(id)).await;
                    self.hub.publish_json(
                        &ControlEvent::task_update(&team.name, id)
                            .with_status(TaskStatus::Failed.as_str()),
                    );
                    // The worktree is deliberately left behind for inspection.
                }
            }
        }
    }

    async fn process_task(&self, team_name: &str, task: &Task) -> Result<(), MergeError> {
        let Some(wf_id) = task.workflow_id.clone().filter(|w| !w.is_empty()) else {
            return Ok(()); // stage name without a workflow; nothing to drive
        };
        let worktree = task
            .worktree_path
            .clone()
            .filter(|w| !w.is_empty())
            .map(PathBuf::from);
        let branch = task.branch_name.clone().filter(|b| !b.is_empty());

        if self.rebase_before_merge {
            if let (Some(wt), Some(br)) = (&worktree, &branch) {
                gitops::rebase_onto_main(wt, br)
                    .await
                    .map_err(|e| MergeError::Rebase(e.to_string()))?;
            }
        }

        if let Some(wt) = &worktree {
            let repos = {
                let name = team_name.to_string();
                self.store
                    .call(move |s| s.list_repos(&name))
                    .await
                    .map_err(MergeError::Other)?
            };
            let repo = repos
                .iter()
                .find(|r| task.repo_name.as_deref() == Some(r.name.as_str()))
                .or_else(|| repos.first());
            if let Some(test_cmd) = repo.and_then(|r| r.test_cmd.as_deref()) {
                gitops::run_test_cmd(wt, test_cmd)
                    .await
                    .map_err(|e| MergeError::Test(e.to_string()))?;
            }
            if let Some(br) = &branch {
                gitops::merge_in_worktree(wt, br)
                    .await
                    .map_err(|e| MergeError::Merge(e.to_string()))?;
            }
        }

        // Finalize: stage Done, status done, git fields cleared, worktree gone.
        let id = task.task_id;
        self.store
            .call(move |s| {
                s.set_task_workflow_and_stage(id, &wf_id, "Done")?;
                s.set_task_status(id, TaskStatus::Done, None)?;
                s.clear_task_git_fields(id)
            })
            .await
            .map_err(MergeError::Other)?;
        if let Some(wt) = &worktree {
            if let Err(e) = gitops::delete_worktree(wt).await {
                warn!(task_id = id, err = %e, "worktree cleanup failed");
            }
        }
        self.hub.publish_json(
            &ControlEvent::task_update(team_name, id)
                .with_status(TaskStatus::Done.as_str())
                .with_stage("Done"),
        );
        info!(team = %team_name, task_id = id, "merge worker completed task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::TempDir;

    async fn worker_with_task(test_cmd: Option<&str>) -> (MergeWorker, i64, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        store.create_team("t1").unwrap();
        store
            .create_repo(
                "t1",
                "repo",
                tmp.path().to_str().unwrap(),
                crate::store::ApprovalMode::Manual,
                test_cmd,
            )
            .unwrap();
        let wf = store.create_workflow("t1", "default", 1, "builtin").unwrap();
        let id = store.create_task("t1", "t", TaskStatus::Todo, Some(&wf)).unwrap();
        store.set_task_workflow_and_stage(id, &wf, MERGING_STAGE).unwrap();
        let worker = MergeWorker {
            store: StoreHandle::new(store),
            hub: Arc::new(EventHub::new()),
            interval: Duration::from_secs(15),
            rebase_before_merge: false,
        };
        (worker, id, tmp)
    }

    #[tokio::test]
    async fn test_task_without_worktree_finalizes() {
        let (worker, id, _tmp) = worker_with_task(None).await;
        worker.run_once().await;

        let task = worker
            .store
            .call(move |s| Ok(s.get_task("t1", id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.current_stage.as_deref(), Some("Done"));
        assert!(task.worktree_path.is_none());
    }

    #[tokio::test]
    async fn test_failing_tests_mark_failed_and_preserve_worktree() {
        let (worker, id, tmp) = worker_with_task(Some("exit 1")).await;
        // Give the task a worktree so the test step runs there.
        let wt = tmp.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        {
            let wt = wt.display().to_string();
            worker
                .store
                .call(move |s| s.set_task_git_fields(id, Some(&wt), Some("branch"), None, Some("repo")))
                .await
                .unwrap();
        }

        worker.run_once().await;

        let task = worker
            .store
            .call(move |s| Ok(s.get_task("t1", id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 1);
        // The worktree survives for inspection.
        assert!(wt.exists());
        assert!(task.worktree_path.is_some());
    }

    #[tokio::test]
    async fn test_merge_failure_classified() {
        let (worker, id, tmp) = worker_with_task(None).await;
        // A directory that is not a git repo makes the merge step fail.
        let wt = tmp.path().join("not-a-repo");
        std::fs::create_dir_all(&wt).unwrap();
        let task = {
            let wt = wt.display().to_string();
            worker
                .store
                .call(move |s| {
                    s.set_task_git_fields(id, Some(&wt), Some("branch"), None, Some("repo"))?;
                    Ok(s.get_task("t1", id)?.unwrap())
                })
                .await
                .unwrap()
        };

        let err = worker.process_task("t1", &task).await.unwrap_err();
        assert!(matches!(err, MergeError::Merge(_)));
    }
}
