use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A team owns agents, tasks, workflows, repos, and messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub team_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub agent_count: i64,
    pub task_count: i64,
}

/// An agent is an identity the scheduler can assign work to, not a process.
/// Role is an open string; "manager" and "engineer" are the built-in values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_manager(&self) -> bool {
        self.role == "manager"
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    InApproval,
    Merging,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::InApproval => "in_approval",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are sticky: the scheduler never claims these again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "in_approval" => Ok(Self::InApproval),
            "merging" => Ok(Self::Merging),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task status: {}", s)),
        }
    }
}

/// A work item. `status` is a coarse summary for listings; when a workflow is
/// attached, `current_stage` is the authoritative progress indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    /// Directly responsible individual: the first assignee ever set. Write-once.
    pub dri: Option<String>,
    pub attempt_count: i64,
    pub workflow_id: Option<String>,
    pub current_stage: Option<String>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub base_sha: Option<String>,
    pub repo_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Agent,
    Human,
    Auto,
    Terminal,
    Merge,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Human => "human",
            Self::Auto => "auto",
            Self::Terminal => "terminal",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "human" => Ok(Self::Human),
            "auto" => Ok(Self::Auto),
            "terminal" => Ok(Self::Terminal),
            "merge" => Ok(Self::Merge),
            _ => Err(format!("invalid stage type: {}", s)),
        }
    }
}

/// One node of a workflow graph. `outcomes` and `candidate_agents` are stored
/// as comma-separated lists (empty string = none).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub workflow_id: String,
    pub stage_name: String,
    pub stage_type: StageType,
    pub outcomes: String,
    pub candidate_agents: String,
}

impl WorkflowStage {
    /// Parsed candidate pool; empty when the stage does not restrict assignment.
    pub fn candidate_pool(&self) -> Vec<String> {
        self.candidate_agents
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// (from_stage, outcome) -> to_stage. The pair is unique per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub workflow_id: String,
    pub from_stage: String,
    pub outcome: String,
    pub to_stage: String,
}

/// A (team, name, version) workflow definition. Versions are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub name: String,
    pub version: i64,
    pub source_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Auto,
    Manual,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("invalid approval mode: {}", s)),
        }
    }
}

/// A git repository linked to a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
    pub source: String,
    pub approval: ApprovalMode,
    pub test_cmd: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    ChangesRequested,
}

impl ReviewOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
        }
    }
}

impl FromStr for ReviewOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            _ => Err(format!("invalid review outcome: {}", s)),
        }
    }
}

/// Append-only review record for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReview {
    pub review_id: i64,
    pub task_id: i64,
    pub reviewer_agent: String,
    pub outcome: ReviewOutcome,
    pub comments: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub comment_id: i64,
    pub task_id: i64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttachment {
    pub attachment_id: i64,
    pub task_id: i64,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

/// Mailbox row. `processed_at == None` means the manager reactor has not
/// consumed it yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trip() {
        for s in [
            "todo",
            "in_progress",
            "in_review",
            "in_approval",
            "merging",
            "done",
            "failed",
            "cancelled",
        ] {
            let parsed = TaskStatus::from_str(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(TaskStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Todo.is_terminal());
        assert!(!TaskStatus::Merging.is_terminal());
    }

    #[test]
    fn test_candidate_pool_parsing() {
        let stage = WorkflowStage {
            workflow_id: "wf".into(),
            stage_name: "InProgress".into(),
            stage_type: StageType::Agent,
            outcomes: "done".into(),
            candidate_agents: "alice, bob ,carol".into(),
        };
        assert_eq!(stage.candidate_pool(), vec!["alice", "bob", "carol"]);

        let empty = WorkflowStage {
            candidate_agents: "".into(),
            ..stage
        };
        assert!(empty.candidate_pool().is_empty());
    }
}
