use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::models::*;

/// Stage name owned by the merge worker. Tasks sitting here are never
/// returned by `next_runnable_task`.
pub const MERGING_STAGE: &str = "Merging";

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))
    }
}

/// SQLite persistence for teams, agents, tasks, workflows, reviews, repos,
/// messages, and the network allowlist.
pub struct Store {
    conn: Connection,
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

const TASK_COLUMNS: &str = "task_id, title, status, assignee, dri, attempt_count, workflow_id, \
     current_stage, worktree_path, branch_name, base_sha, repo_name, created_at, updated_at";

fn scan_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(2)?;
    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        status: TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Todo),
        assignee: row.get(3)?,
        dri: row.get(4)?,
        attempt_count: row.get(5)?,
        workflow_id: row.get(6)?,
        current_stage: row.get(7)?,
        worktree_path: row.get(8)?,
        branch_name: row.get(9)?,
        base_sha: row.get(10)?,
        repo_name: row.get(11)?,
        created_at: from_unix(row.get(12)?),
        updated_at: from_unix(row.get(13)?),
    })
}

impl Store {
    /// Open (or create) the database at `<home>/protected/db.sqlite`.
    pub fn open(home: &Path) -> Result<Self> {
        let db_path = home.join("protected").join("db.sqlite");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create protected dir")?;
        }
        Self::open_path(&db_path)
    }

    /// Open a SQLite database at an explicit path (AGENTARY_DB override).
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        self.conn
            .pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous")?;
        self.conn
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        self.conn
            .pragma_update(None, "busy_timeout", 5000)
            .context("failed to set busy timeout")?;
        self.migrate().context("failed to run migrations")?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS teams (
                    team_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agents (
                    agent_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL REFERENCES teams(team_id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'engineer',
                    created_at INTEGER NOT NULL,
                    UNIQUE(team_id, name)
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id TEXT NOT NULL REFERENCES teams(team_id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'todo',
                    assignee TEXT,
                    dri TEXT,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    workflow_id TEXT,
                    current_stage TEXT,
                    worktree_path TEXT,
                    branch_name TEXT,
                    base_sha TEXT,
                    repo_name TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_comments (
                    comment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                    author TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_attachments (
                    attachment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                    file_path TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE(task_id, file_path)
                );

                CREATE TABLE IF NOT EXISTS task_dependencies (
                    task_id INTEGER NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                    depends_on_task_id INTEGER NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                    PRIMARY KEY (task_id, depends_on_task_id)
                );

                CREATE TABLE IF NOT EXISTS task_reviews (
                    review_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                    reviewer_agent TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    comments TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS repos (
                    repo_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL REFERENCES teams(team_id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    source TEXT NOT NULL,
                    approval TEXT NOT NULL DEFAULT 'manual',
                    test_cmd TEXT,
                    created_at INTEGER NOT NULL,
                    UNIQUE(team_id, name)
                );

                CREATE TABLE IF NOT EXISTS workflows (
                    workflow_id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL REFERENCES teams(team_id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    source_path TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL,
                    UNIQUE(team_id, name, version)
                );

                CREATE TABLE IF NOT EXISTS workflow_stages (
                    workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
                    stage_name TEXT NOT NULL,
                    stage_type TEXT NOT NULL,
                    outcomes TEXT NOT NULL DEFAULT '',
                    candidate_agents TEXT NOT NULL DEFAULT '',
                    UNIQUE(workflow_id, stage_name)
                );

                CREATE TABLE IF NOT EXISTS workflow_transitions (
                    workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
                    from_stage TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    to_stage TEXT NOT NULL,
                    UNIQUE(workflow_id, from_stage, outcome)
                );

                CREATE TABLE IF NOT EXISTS messages (
                    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    team_id TEXT NOT NULL REFERENCES teams(team_id) ON DELETE CASCADE,
                    sender TEXT NOT NULL,
                    recipient TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    processed_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS network_allowlist (
                    domain TEXT PRIMARY KEY
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_team_status ON tasks(team_id, status, updated_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_team_stage ON tasks(team_id, current_stage, updated_at);
                CREATE INDEX IF NOT EXISTS idx_messages_inbox ON messages(team_id, recipient, processed_at, created_at);
                ",
            )
            .context("failed to create tables")?;
        Ok(())
    }

    // ── Teams ─────────────────────────────────────────────────────────

    pub fn create_team(&self, name: &str) -> Result<Team> {
        if name.is_empty() {
            anyhow::bail!("team name required");
        }
        let id = random_id();
        let now = now_unix();
        self.conn
            .execute(
                "INSERT INTO teams(team_id, name, created_at) VALUES(?1, ?2, ?3)",
                params![id, name, now],
            )
            .context("failed to insert team")?;
        Ok(Team {
            team_id: id,
            name: name.to_string(),
            created_at: from_unix(now),
            agent_count: 0,
            task_count: 0,
        })
    }

    pub fn get_team(&self, name: &str) -> Result<Team> {
        self.conn
            .query_row(
                "SELECT team_id, name, created_at,
                    (SELECT COUNT(*) FROM agents a WHERE a.team_id = t.team_id),
                    (SELECT COUNT(*) FROM tasks k WHERE k.team_id = t.team_id)
                 FROM teams t WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Team {
                        team_id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: from_unix(row.get(2)?),
                        agent_count: row.get(3)?,
                        task_count: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("failed to query team")?
            .with_context(|| format!("team not found: {}", name))
    }

    pub fn list_teams(&self) -> Result<Vec<Team>> {
        let mut stmt = self.conn.prepare(
            "SELECT team_id, name, created_at,
                (SELECT COUNT(*) FROM agents a WHERE a.team_id = t.team_id),
                (SELECT COUNT(*) FROM tasks k WHERE k.team_id = t.team_id)
             FROM teams t ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Team {
                team_id: row.get(0)?,
                name: row.get(1)?,
                created_at: from_unix(row.get(2)?),
                agent_count: row.get(3)?,
                task_count: row.get(4)?,
            })
        })?;
        let mut teams = Vec::new();
        for row in rows {
            teams.push(row.context("failed to read team row")?);
        }
        Ok(teams)
    }

    /// Delete a team. Agents, tasks, workflows, repos, and messages cascade.
    pub fn delete_team(&self, name: &str) -> Result<()> {
        let team = self.get_team(name)?;
        self.conn
            .execute("DELETE FROM teams WHERE team_id = ?1", params![team.team_id])
            .context("failed to delete team")?;
        Ok(())
    }

    // ── Agents ────────────────────────────────────────────────────────

    pub fn create_agent(&self, team_name: &str, name: &str, role: &str) -> Result<()> {
        let team = self.get_team(team_name)?;
        if name.is_empty() {
            anyhow::bail!("agent name required");
        }
        let role = if role.is_empty() { "engineer" } else { role };
        self.conn
            .execute(
                "INSERT INTO agents(agent_id, team_id, name, role, created_at) VALUES(?1, ?2, ?3, ?4, ?5)",
                params![random_id(), team.team_id, name, role, now_unix()],
            )
            .context("failed to insert agent")?;
        Ok(())
    }

    /// Agents in insertion order. The scheduler's "first agent" tie-breaks
    /// depend on this ordering.
    pub fn list_agents(&self, team_name: &str) -> Result<Vec<Agent>> {
        let team = self.get_team(team_name)?;
        let mut stmt = self.conn.prepare(
            "SELECT name, role, created_at FROM agents WHERE team_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![team.team_id], |row| {
            Ok(Agent {
                name: row.get(0)?,
                role: row.get(1)?,
                created_at: from_unix(row.get(2)?),
            })
        })?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("failed to read agent row")?);
        }
        Ok(agents)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        team_name: &str,
        title: &str,
        status: TaskStatus,
        workflow_id: Option<&str>,
    ) -> Result<i64> {
        let team = self.get_team(team_name)?;
        if title.is_empty() {
            anyhow::bail!("title required");
        }
        let now = now_unix();
        self.conn
            .execute(
                "INSERT INTO tasks(team_id, title, status, created_at, updated_at) VALUES(?1, ?2, ?3, ?4, ?5)",
                params![team.team_id, title, status.as_str(), now, now],
            )
            .context("failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        if let Some(wf_id) = workflow_id.filter(|w| !w.is_empty()) {
            if let Ok(initial) = self.initial_stage(wf_id) {
                self.conn.execute(
                    "UPDATE tasks SET workflow_id=?1, current_stage=?2, updated_at=?3 WHERE task_id=?4",
                    params![wf_id, initial, now, id],
                )?;
            }
        }
        Ok(id)
    }

    pub fn list_tasks(&self, team_name: &str, limit: i64) -> Result<Vec<Task>> {
        let team = self.get_team(team_name)?;
        let q = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE team_id = ?1 ORDER BY created_at DESC, task_id DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&q)?;
        let limit = if limit > 0 { limit } else { i64::MAX };
        let rows = stmt.query_map(params![team.team_id, limit], scan_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("failed to read task row")?);
        }
        Ok(tasks)
    }

    /// Tasks currently sitting in the given workflow stage, oldest-updated
    /// first. The merge worker's work queue.
    pub fn list_tasks_in_stage(&self, team_name: &str, stage: &str, limit: i64) -> Result<Vec<Task>> {
        let team = self.get_team(team_name)?;
        let q = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE team_id = ?1 AND current_stage = ?2 \
             ORDER BY updated_at ASC, task_id ASC LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&q)?;
        let limit = if limit > 0 { limit } else { i64::MAX };
        let rows = stmt.query_map(params![team.team_id, stage, limit], scan_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("failed to read task row")?);
        }
        Ok(tasks)
    }

    pub fn get_task(&self, team_name: &str, task_id: i64) -> Result<Option<Task>> {
        let team = self.get_team(team_name)?;
        let q = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1 AND team_id = ?2");
        self.conn
            .query_row(&q, params![task_id, team.team_id], scan_task)
            .optional()
            .context("failed to query task")
    }

    /// The one oldest-updated runnable task for the team, or None. Tasks in
    /// the merge worker's stage are excluded even when their status is
    /// runnable.
    pub fn next_runnable_task(&self, team_name: &str) -> Result<Option<Task>> {
        let team = self.get_team(team_name)?;
        let q = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE team_id = ?1 AND status IN ('todo','in_progress') \
               AND (current_stage IS NULL OR current_stage != ?2) \
             ORDER BY updated_at ASC, task_id ASC LIMIT 1"
        );
        self.conn
            .query_row(&q, params![team.team_id, MERGING_STAGE], scan_task)
            .optional()
            .context("failed to query next runnable task")
    }

    /// Atomically claim a `todo` task: status becomes in_progress, assignee is
    /// set, and `dri` is filled if this is the first assignment. Returns false
    /// when another worker won the race (or the task left `todo`).
    pub fn claim_task(&self, team_name: &str, task_id: i64, assignee: &str) -> Result<bool> {
        let team = self.get_team(team_name)?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status='in_progress', assignee=?1, dri=COALESCE(dri, ?1), updated_at=?2 \
                 WHERE task_id=?3 AND team_id=?4 AND status='todo'",
                params![assignee, now_unix(), task_id, team.team_id],
            )
            .context("failed to claim task")?;
        Ok(changed > 0)
    }

    /// Set status and assignee in one touch. `assignee` None clears the
    /// field; a non-null assignee also fills `dri` on first assignment.
    pub fn set_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        assignee: Option<&str>,
    ) -> Result<()> {
        match assignee {
            Some(a) => {
                self.conn.execute(
                    "UPDATE tasks SET status=?1, assignee=?2, dri=COALESCE(dri, ?2), updated_at=?3 WHERE task_id=?4",
                    params![status.as_str(), a, now_unix(), task_id],
                )?;
            }
            None => {
                self.conn.execute(
                    "UPDATE tasks SET status=?1, assignee=NULL, updated_at=?2 WHERE task_id=?3",
                    params![status.as_str(), now_unix(), task_id],
                )?;
            }
        }
        Ok(())
    }

    /// Change the assignee without touching status. `dri` is filled on the
    /// first non-null assignment and never overwritten after.
    pub fn assign_task(&self, task_id: i64, assignee: Option<&str>) -> Result<()> {
        match assignee {
            Some(a) => {
                self.conn.execute(
                    "UPDATE tasks SET assignee=?1, dri=COALESCE(dri, ?1), updated_at=?2 WHERE task_id=?3",
                    params![a, now_unix(), task_id],
                )?;
            }
            None => {
                self.conn.execute(
                    "UPDATE tasks SET assignee=NULL, updated_at=?1 WHERE task_id=?2",
                    params![now_unix(), task_id],
                )?;
            }
        }
        Ok(())
    }

    /// status=failed and attempt_count += 1.
    pub fn set_task_failed(&self, task_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET status='failed', attempt_count=attempt_count+1, updated_at=?1 WHERE task_id=?2",
            params![now_unix(), task_id],
        )?;
        Ok(())
    }

    /// status=todo, assignee cleared. `dri` and attempt_count are preserved.
    pub fn requeue_task(&self, team_name: &str, task_id: i64) -> Result<()> {
        let team = self.get_team(team_name)?;
        self.conn.execute(
            "UPDATE tasks SET status='todo', assignee=NULL, updated_at=?1 WHERE task_id=?2 AND team_id=?3",
            params![now_unix(), task_id, team.team_id],
        )?;
        Ok(())
    }

    /// status=cancelled, assignee cleared. The caller separately clears git
    /// fields and deletes the worktree.
    pub fn cancel_task(&self, team_name: &str, task_id: i64) -> Result<()> {
        let team = self.get_team(team_name)?;
        self.conn.execute(
            "UPDATE tasks SET status='cancelled', assignee=NULL, updated_at=?1 WHERE task_id=?2 AND team_id=?3",
            params![now_unix(), task_id, team.team_id],
        )?;
        Ok(())
    }

    /// status=todo, assignee cleared, current_stage reset to the workflow's
    /// initial stage (or null when no workflow is attached).
    pub fn rewind_task(&self, team_name: &str, task_id: i64) -> Result<()> {
        let team = self.get_team(team_name)?;
        let task = self
            .get_task(team_name, task_id)?
            .context("task not found")?;
        match task.workflow_id.as_deref().filter(|w| !w.is_empty()) {
            Some(wf_id) => {
                let initial = self.initial_stage(wf_id)?;
                self.conn.execute(
                    "UPDATE tasks SET status='todo', assignee=NULL, current_stage=?1, updated_at=?2 \
                     WHERE task_id=?3 AND team_id=?4",
                    params![initial, now_unix(), task_id, team.team_id],
                )?;
            }
            None => {
                self.conn.execute(
                    "UPDATE tasks SET status='todo', assignee=NULL, current_stage=NULL, updated_at=?1 \
                     WHERE task_id=?2 AND team_id=?3",
                    params![now_unix(), task_id, team.team_id],
                )?;
            }
        }
        Ok(())
    }

    pub fn update_task_stage(&self, task_id: i64, stage: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET current_stage=?1, updated_at=?2 WHERE task_id=?3",
            params![stage, now_unix(), task_id],
        )?;
        Ok(())
    }

    pub fn set_task_workflow_and_stage(&self, task_id: i64, workflow_id: &str, stage: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET workflow_id=?1, current_stage=?2, updated_at=?3 WHERE task_id=?4",
            params![workflow_id, stage, now_unix(), task_id],
        )?;
        Ok(())
    }

    /// worktree_path and branch_name are always set or cleared together.
    pub fn set_task_git_fields(
        &self,
        task_id: i64,
        worktree_path: Option<&str>,
        branch_name: Option<&str>,
        base_sha: Option<&str>,
        repo_name: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET worktree_path=?1, branch_name=?2, base_sha=?3, repo_name=?4, updated_at=?5 \
             WHERE task_id=?6",
            params![worktree_path, branch_name, base_sha, repo_name, now_unix(), task_id],
        )?;
        Ok(())
    }

    pub fn clear_task_git_fields(&self, task_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET worktree_path=NULL, branch_name=NULL, base_sha=NULL, repo_name=NULL, updated_at=?1 \
             WHERE task_id=?2",
            params![now_unix(), task_id],
        )?;
        Ok(())
    }

    // ── Task comments / attachments / dependencies ────────────────────

    pub fn create_task_comment(&self, team_name: &str, task_id: i64, author: &str, body: &str) -> Result<i64> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        self.conn.execute(
            "INSERT INTO task_comments(task_id, author, body, created_at) VALUES(?1, ?2, ?3, ?4)",
            params![task_id, author, body, now_unix()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_task_comments(&self, team_name: &str, task_id: i64) -> Result<Vec<TaskComment>> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        let mut stmt = self.conn.prepare(
            "SELECT comment_id, task_id, author, body, created_at FROM task_comments \
             WHERE task_id = ?1 ORDER BY created_at DESC, comment_id DESC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(TaskComment {
                comment_id: row.get(0)?,
                task_id: row.get(1)?,
                author: row.get(2)?,
                body: row.get(3)?,
                created_at: from_unix(row.get(4)?),
            })
        })?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row.context("failed to read comment row")?);
        }
        Ok(comments)
    }

    pub fn add_task_attachment(&self, team_name: &str, task_id: i64, file_path: &str) -> Result<()> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO task_attachments(task_id, file_path, created_at) VALUES(?1, ?2, ?3)",
            params![task_id, file_path, now_unix()],
        )?;
        Ok(())
    }

    pub fn remove_task_attachment(&self, team_name: &str, task_id: i64, file_path: &str) -> Result<()> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        self.conn.execute(
            "DELETE FROM task_attachments WHERE task_id=?1 AND file_path=?2",
            params![task_id, file_path],
        )?;
        Ok(())
    }

    pub fn list_task_attachments(&self, team_name: &str, task_id: i64) -> Result<Vec<TaskAttachment>> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        let mut stmt = self.conn.prepare(
            "SELECT attachment_id, task_id, file_path, created_at FROM task_attachments \
             WHERE task_id = ?1 ORDER BY created_at ASC, attachment_id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(TaskAttachment {
                attachment_id: row.get(0)?,
                task_id: row.get(1)?,
                file_path: row.get(2)?,
                created_at: from_unix(row.get(3)?),
            })
        })?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row.context("failed to read attachment row")?);
        }
        Ok(attachments)
    }

    /// Record "task depends on other". Both must belong to the same team.
    pub fn add_task_dependency(&self, team_name: &str, task_id: i64, depends_on: i64) -> Result<()> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        self.get_task(team_name, depends_on)?
            .with_context(|| format!("dependency task {} not found in team", depends_on))?;
        self.conn.execute(
            "INSERT OR IGNORE INTO task_dependencies(task_id, depends_on_task_id) VALUES(?1, ?2)",
            params![task_id, depends_on],
        )?;
        Ok(())
    }

    pub fn list_task_dependencies(&self, team_name: &str, task_id: i64) -> Result<Vec<i64>> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        let mut stmt = self
            .conn
            .prepare("SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, i64>(0))?;
        let mut deps = Vec::new();
        for row in rows {
            deps.push(row.context("failed to read dependency row")?);
        }
        Ok(deps)
    }

    // ── Task reviews ──────────────────────────────────────────────────

    pub fn create_task_review(
        &self,
        team_name: &str,
        task_id: i64,
        reviewer_agent: &str,
        outcome: ReviewOutcome,
        comments: &str,
    ) -> Result<i64> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        self.conn.execute(
            "INSERT INTO task_reviews(task_id, reviewer_agent, outcome, comments, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![task_id, reviewer_agent, outcome.as_str(), comments, now_unix()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_task_reviews(&self, team_name: &str, task_id: i64) -> Result<Vec<TaskReview>> {
        self.get_task(team_name, task_id)?.context("task not found")?;
        let mut stmt = self.conn.prepare(
            "SELECT review_id, task_id, reviewer_agent, outcome, comments, created_at \
             FROM task_reviews WHERE task_id = ?1 ORDER BY created_at DESC, review_id DESC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let outcome_str: String = row.get(3)?;
            Ok(TaskReview {
                review_id: row.get(0)?,
                task_id: row.get(1)?,
                reviewer_agent: row.get(2)?,
                outcome: ReviewOutcome::from_str(&outcome_str).unwrap_or(ReviewOutcome::Approved),
                comments: row.get(4)?,
                created_at: from_unix(row.get(5)?),
            })
        })?;
        let mut reviews = Vec::new();
        for row in rows {
            reviews.push(row.context("failed to read review row")?);
        }
        Ok(reviews)
    }

    // ── Repos ─────────────────────────────────────────────────────────

    pub fn create_repo(
        &self,
        team_name: &str,
        name: &str,
        source: &str,
        approval: ApprovalMode,
        test_cmd: Option<&str>,
    ) -> Result<()> {
        let team = self.get_team(team_name)?;
        if name.is_empty() {
            anyhow::bail!("repo name required");
        }
        if source.is_empty() {
            anyhow::bail!("repo source required");
        }
        self.conn.execute(
            "INSERT INTO repos(repo_id, team_id, name, source, approval, test_cmd, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![random_id(), team.team_id, name, source, approval.as_str(), test_cmd, now_unix()],
        )?;
        Ok(())
    }

    pub fn list_repos(&self, team_name: &str) -> Result<Vec<Repo>> {
        let team = self.get_team(team_name)?;
        let mut stmt = self.conn.prepare(
            "SELECT name, source, approval, test_cmd, created_at FROM repos \
             WHERE team_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![team.team_id], |row| {
            let approval_str: String = row.get(2)?;
            Ok(Repo {
                name: row.get(0)?,
                source: row.get(1)?,
                approval: ApprovalMode::from_str(&approval_str).unwrap_or(ApprovalMode::Manual),
                test_cmd: row.get(3)?,
                created_at: from_unix(row.get(4)?),
            })
        })?;
        let mut repos = Vec::new();
        for row in rows {
            repos.push(row.context("failed to read repo row")?);
        }
        Ok(repos)
    }

    pub fn set_repo_approval(&self, team_name: &str, repo_name: &str, approval: ApprovalMode) -> Result<()> {
        let team = self.get_team(team_name)?;
        let changed = self.conn.execute(
            "UPDATE repos SET approval=?1 WHERE team_id=?2 AND name=?3",
            params![approval.as_str(), team.team_id, repo_name],
        )?;
        if changed == 0 {
            anyhow::bail!("repo not found");
        }
        Ok(())
    }

    // ── Workflows ─────────────────────────────────────────────────────

    /// Create a (team, name, version) workflow row. Creating the default
    /// workflow also seeds its built-in stages and transitions; recreating an
    /// existing version is rejected by the unique constraint.
    pub fn create_workflow(&self, team_name: &str, name: &str, version: i64, source_path: &str) -> Result<String> {
        let team = self.get_team(team_name)?;
        if name.is_empty() {
            anyhow::bail!("workflow name required");
        }
        if version <= 0 {
            anyhow::bail!("workflow version must be > 0");
        }
        let wf_id = random_id();
        self.conn.execute(
            "INSERT INTO workflows(workflow_id, team_id, name, version, source_path, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![wf_id, team.team_id, name, version, source_path, now_unix()],
        )?;
        if name == "default" && version == 1 {
            self.seed_default_stages(&wf_id)?;
        }
        Ok(wf_id)
    }

    /// Create a workflow and install explicit stages/transitions, replacing
    /// any default seed. The stage graph must have exactly one initial stage
    /// (a stage that is no transition's target); anything else is malformed
    /// and nothing is written.
    pub fn create_workflow_with_stages(
        &self,
        team_name: &str,
        name: &str,
        version: i64,
        source_path: &str,
        stages: &[WorkflowStage],
        transitions: &[WorkflowTransition],
    ) -> Result<String> {
        validate_initial_stage(stages, transitions)?;
        let wf_id = self.create_workflow(team_name, name, version, source_path)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin transaction")?;
        tx.execute("DELETE FROM workflow_stages WHERE workflow_id = ?1", params![wf_id])?;
        tx.execute("DELETE FROM workflow_transitions WHERE workflow_id = ?1", params![wf_id])?;
        for stage in stages {
            tx.execute(
                "INSERT INTO workflow_stages(workflow_id, stage_name, stage_type, outcomes, candidate_agents) \
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    wf_id,
                    stage.stage_name,
                    stage.stage_type.as_str(),
                    stage.outcomes,
                    stage.candidate_agents
                ],
            )?;
        }
        for tr in transitions {
            tx.execute(
                "INSERT INTO workflow_transitions(workflow_id, from_stage, outcome, to_stage) \
                 VALUES(?1, ?2, ?3, ?4)",
                params![wf_id, tr.from_stage, tr.outcome, tr.to_stage],
            )?;
        }
        tx.commit().context("failed to commit workflow stages")?;
        Ok(wf_id)
    }

    /// Built-in default: Coding -> InReview -> InApproval -> Merging -> Done,
    /// with rework flowing through a dedicated InProgress stage. Rework must
    /// not target Coding: the initial stage is defined as the one stage that
    /// is no transition's target, so a loop back to it would leave the
    /// workflow without a computable entry point.
    fn seed_default_stages(&self, wf_id: &str) -> Result<()> {
        let stages: &[(&str, &str, &str)] = &[
            ("Coding", "agent", "submit_for_review,done"),
            ("InReview", "agent", "approved,changes_requested"),
            ("InApproval", "human", "approved,changes_requested"),
            ("InProgress", "agent", "done"),
            ("Merging", "merge", "done"),
            ("Done", "terminal", ""),
        ];
        let transitions: &[(&str, &str, &str)] = &[
            ("Coding", "submit_for_review", "InReview"),
            ("Coding", "done", "Done"),
            ("InReview", "approved", "InApproval"),
            ("InReview", "changes_requested", "InProgress"),
            ("InApproval", "approved", "Merging"),
            ("InApproval", "changes_requested", "InProgress"),
            ("InProgress", "done", "InReview"),
            ("Merging", "done", "Done"),
        ];
        for (name, kind, outcomes) in stages {
            self.conn.execute(
                "INSERT OR IGNORE INTO workflow_stages(workflow_id, stage_name, stage_type, outcomes) \
                 VALUES(?1, ?2, ?3, ?4)",
                params![wf_id, name, kind, outcomes],
            )?;
        }
        for (from, outcome, to) in transitions {
            self.conn.execute(
                "INSERT OR IGNORE INTO workflow_transitions(workflow_id, from_stage, outcome, to_stage) \
                 VALUES(?1, ?2, ?3, ?4)",
                params![wf_id, from, outcome, to],
            )?;
        }
        Ok(())
    }

    pub fn list_workflows(&self, team_name: &str) -> Result<Vec<Workflow>> {
        let team = self.get_team(team_name)?;
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, name, version, source_path, created_at FROM workflows \
             WHERE team_id = ?1 ORDER BY name ASC, version DESC",
        )?;
        let rows = stmt.query_map(params![team.team_id], |row| {
            Ok(Workflow {
                workflow_id: row.get(0)?,
                name: row.get(1)?,
                version: row.get(2)?,
                source_path: row.get(3)?,
                created_at: from_unix(row.get(4)?),
            })
        })?;
        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row.context("failed to read workflow row")?);
        }
        Ok(workflows)
    }

    pub fn workflow_id_by_name(&self, team_name: &str, name: &str, version: i64) -> Result<Option<String>> {
        let team = self.get_team(team_name)?;
        self.conn
            .query_row(
                "SELECT workflow_id FROM workflows WHERE team_id = ?1 AND name = ?2 AND version = ?3 LIMIT 1",
                params![team.team_id, name, version],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query workflow id")
    }

    pub fn get_workflow_stages(&self, workflow_id: &str) -> Result<Vec<WorkflowStage>> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, stage_name, stage_type, outcomes, candidate_agents \
             FROM workflow_stages WHERE workflow_id = ?1 ORDER BY stage_name ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id], |row| {
            let type_str: String = row.get(2)?;
            Ok(WorkflowStage {
                workflow_id: row.get(0)?,
                stage_name: row.get(1)?,
                stage_type: StageType::from_str(&type_str).unwrap_or(StageType::Auto),
                outcomes: row.get(3)?,
                candidate_agents: row.get(4)?,
            })
        })?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.context("failed to read stage row")?);
        }
        Ok(stages)
    }

    pub fn get_workflow_transitions(&self, workflow_id: &str) -> Result<Vec<WorkflowTransition>> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, from_stage, outcome, to_stage FROM workflow_transitions \
             WHERE workflow_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id], |row| {
            Ok(WorkflowTransition {
                workflow_id: row.get(0)?,
                from_stage: row.get(1)?,
                outcome: row.get(2)?,
                to_stage: row.get(3)?,
            })
        })?;
        let mut transitions = Vec::new();
        for row in rows {
            transitions.push(row.context("failed to read transition row")?);
        }
        Ok(transitions)
    }

    /// The unique stage that is no transition's target.
    pub fn initial_stage(&self, workflow_id: &str) -> Result<String> {
        let stages = self.get_workflow_stages(workflow_id)?;
        let transitions = self.get_workflow_transitions(workflow_id)?;
        let mut initials: Vec<&str> = stages
            .iter()
            .map(|s| s.stage_name.as_str())
            .filter(|name| !transitions.iter().any(|t| t.to_stage == *name))
            .collect();
        match initials.len() {
            1 => Ok(initials.remove(0).to_string()),
            0 => anyhow::bail!("workflow has no initial stage"),
            _ => anyhow::bail!("workflow has more than one initial stage"),
        }
    }

    // ── Network allowlist ─────────────────────────────────────────────

    pub fn list_allowed_domains(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT domain FROM network_allowlist ORDER BY domain ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut domains = Vec::new();
        for row in rows {
            domains.push(row.context("failed to read allowlist row")?);
        }
        Ok(domains)
    }

    /// Reset to unrestricted: the "*" pseudo-entry alone.
    pub fn reset_allowlist(&self) -> Result<()> {
        self.conn.execute("DELETE FROM network_allowlist", [])?;
        self.conn
            .execute("INSERT OR IGNORE INTO network_allowlist(domain) VALUES('*')", [])?;
        Ok(())
    }

    /// Allowing a concrete domain removes the wildcard; allowing "*" resets.
    pub fn allow_domain(&self, domain: &str) -> Result<()> {
        if domain.is_empty() {
            anyhow::bail!("domain required");
        }
        if domain == "*" {
            return self.reset_allowlist();
        }
        self.conn
            .execute("DELETE FROM network_allowlist WHERE domain = '*'", [])?;
        self.conn.execute(
            "INSERT OR IGNORE INTO network_allowlist(domain) VALUES(?1)",
            params![domain],
        )?;
        Ok(())
    }

    /// The allowlist is never left empty; removing the last entry resets to
    /// unrestricted.
    pub fn disallow_domain(&self, domain: &str) -> Result<()> {
        if domain.is_empty() {
            anyhow::bail!("domain required");
        }
        self.conn.execute(
            "DELETE FROM network_allowlist WHERE domain = ?1",
            params![domain],
        )?;
        if self.list_allowed_domains()?.is_empty() {
            self.reset_allowlist()?;
        }
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn create_message(&self, team_name: &str, sender: &str, recipient: &str, content: &str) -> Result<i64> {
        let team = self.get_team(team_name)?;
        self.conn.execute(
            "INSERT INTO messages(team_id, sender, recipient, content, created_at) VALUES(?1, ?2, ?3, ?4, ?5)",
            params![team.team_id, sender, recipient, content, now_unix()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Messages for a team, optionally filtered by recipient, newest first.
    pub fn list_messages(&self, team_name: &str, recipient: &str, limit: i64) -> Result<Vec<Message>> {
        let team = self.get_team(team_name)?;
        let limit = if limit > 0 { limit } else { i64::MAX };
        let map = |row: &Row<'_>| -> rusqlite::Result<Message> {
            Ok(Message {
                message_id: row.get(0)?,
                sender: row.get(1)?,
                recipient: row.get(2)?,
                content: row.get(3)?,
                created_at: from_unix(row.get(4)?),
                processed_at: row.get::<_, Option<i64>>(5)?.map(from_unix),
            })
        };
        let mut messages = Vec::new();
        if recipient.is_empty() {
            let mut stmt = self.conn.prepare(
                "SELECT message_id, sender, recipient, content, created_at, processed_at \
                 FROM messages WHERE team_id = ?1 \
                 ORDER BY created_at DESC, message_id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![team.team_id, limit], map)?;
            for row in rows {
                messages.push(row.context("failed to read message row")?);
            }
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT message_id, sender, recipient, content, created_at, processed_at \
                 FROM messages WHERE team_id = ?1 AND recipient = ?2 \
                 ORDER BY created_at DESC, message_id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![team.team_id, recipient, limit], map)?;
            for row in rows {
                messages.push(row.context("failed to read message row")?);
            }
        }
        Ok(messages)
    }

    /// Unconsumed inbox for a recipient, oldest first: the order the manager
    /// reactor handles them in.
    pub fn list_unprocessed_messages(&self, team_name: &str, recipient: &str, limit: i64) -> Result<Vec<Message>> {
        if recipient.is_empty() {
            return Ok(Vec::new());
        }
        let team = self.get_team(team_name)?;
        let mut stmt = self.conn.prepare(
            "SELECT message_id, sender, recipient, content, created_at, processed_at \
             FROM messages WHERE team_id = ?1 AND recipient = ?2 AND processed_at IS NULL \
             ORDER BY created_at ASC, message_id ASC LIMIT ?3",
        )?;
        let limit = if limit > 0 { limit } else { i64::MAX };
        let rows = stmt.query_map(params![team.team_id, recipient, limit], |row| {
            Ok(Message {
                message_id: row.get(0)?,
                sender: row.get(1)?,
                recipient: row.get(2)?,
                content: row.get(3)?,
                created_at: from_unix(row.get(4)?),
                processed_at: row.get::<_, Option<i64>>(5)?.map(from_unix),
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("failed to read message row")?);
        }
        Ok(messages)
    }

    pub fn mark_message_processed(&self, message_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE messages SET processed_at=?1 WHERE message_id=?2",
            params![now_unix(), message_id],
        )?;
        Ok(())
    }

    // ── Seeds ─────────────────────────────────────────────────────────

    /// Ensure a default team with a manager, two engineers, a default
    /// workflow, and a welcome task exist. Idempotent across restarts.
    pub fn seed_demo(&self) -> Result<()> {
        if self.list_teams()?.is_empty() {
            self.create_team("default")?;
        }
        let agents = match self.list_agents("default") {
            Ok(a) => a,
            Err(_) => return Ok(()), // team renamed by the user; nothing to seed
        };
        let has = |name: &str| agents.iter().any(|a| a.name == name);
        if !has("agentary") {
            let _ = self.create_agent("default", "agentary", "manager");
        }
        if !has("alice") {
            let _ = self.create_agent("default", "alice", "engineer");
        }
        if !has("bob") {
            let _ = self.create_agent("default", "bob", "engineer");
        }
        if self.workflow_id_by_name("default", "default", 1)?.is_none() {
            let _ = self.create_workflow("default", "default", 1, "builtin");
        }
        if self.list_tasks("default", 0)?.is_empty() {
            let wf = self.workflow_id_by_name("default", "default", 1)?;
            let _ = self.create_task("default", "Welcome to Agentary", TaskStatus::Todo, wf.as_deref());
        }
        Ok(())
    }
}

/// Reject stage graphs with zero or multiple initial stages before any row is
/// written.
fn validate_initial_stage(stages: &[WorkflowStage], transitions: &[WorkflowTransition]) -> Result<()> {
    let initials = stages
        .iter()
        .filter(|s| !transitions.iter().any(|t| t.to_stage == s.stage_name))
        .count();
    match initials {
        1 => Ok(()),
        0 => anyhow::bail!("malformed workflow: no initial stage"),
        n => anyhow::bail!("malformed workflow: {} initial stages", n),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
