//! On-disk layout for team and agent state under the home directory:
//! `teams/<safe_team>/agents/<safe_agent>/` with `journal.md`, `notes/`, and
//! an optional `config.yaml`; `teams/<safe_team>/shared/` and `charter.md`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filesystem-safe name: spaces become underscores, otherwise verbatim.
pub fn safe_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

pub fn team_dir(home: &Path, team_name: &str) -> PathBuf {
    home.join("teams").join(safe_name(team_name))
}

pub fn agent_dir(team_dir: &Path, agent_name: &str) -> PathBuf {
    team_dir.join("agents").join(safe_name(agent_name))
}

pub fn shared_dir(team_dir: &Path) -> PathBuf {
    team_dir.join("shared")
}

pub fn charter_path(team_dir: &Path) -> PathBuf {
    team_dir.join("charter.md")
}

pub fn journal_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join("journal.md")
}

pub fn notes_dir(agent_dir: &Path) -> PathBuf {
    agent_dir.join("notes")
}

pub fn agent_config_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join("config.yaml")
}

pub fn ensure_team_dirs(team_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(team_dir).context("failed to create team dir")?;
    std::fs::create_dir_all(shared_dir(team_dir)).context("failed to create shared dir")
}

pub fn ensure_agent_dir(team_dir: &Path, agent_name: &str) -> Result<()> {
    let dir = agent_dir(team_dir, agent_name);
    std::fs::create_dir_all(&dir).context("failed to create agent dir")?;
    std::fs::create_dir_all(notes_dir(&dir)).context("failed to create notes dir")
}

/// Team charter markdown; empty when none has been written yet.
pub fn read_charter(team_dir: &Path) -> Result<String> {
    match std::fs::read_to_string(charter_path(team_dir)) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).context("failed to read charter"),
    }
}

pub fn write_charter(team_dir: &Path, content: &str) -> Result<()> {
    std::fs::create_dir_all(team_dir).context("failed to create team dir")?;
    std::fs::write(charter_path(team_dir), content).context("failed to write charter")
}

/// Per-agent model settings from `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

/// Returns None when the agent has no config file.
pub fn load_agent_config(agent_dir: &Path) -> Result<Option<AgentConfig>> {
    let path = agent_config_path(agent_dir);
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("failed to read agent config"),
    };
    let cfg: AgentConfig = serde_yaml::from_str(&data).context("failed to parse agent config")?;
    Ok(Some(cfg))
}

pub fn save_agent_config(agent_dir: &Path, cfg: &AgentConfig) -> Result<()> {
    std::fs::create_dir_all(agent_dir).context("failed to create agent dir")?;
    let data = serde_yaml::to_string(cfg).context("failed to encode agent config")?;
    std::fs::write(agent_config_path(agent_dir), data).context("failed to write agent config")
}

/// One markdown block appended to an agent's journal after a turn.
#[derive(Debug, Clone, Default)]
pub struct JournalEntry {
    pub task_id: i64,
    pub task_title: String,
    pub outcome: String,
    pub created_at: Option<DateTime<Utc>>,
}

pub fn append_journal(team_dir: &Path, agent_name: &str, entry: &JournalEntry) -> Result<()> {
    let dir = agent_dir(team_dir, agent_name);
    std::fs::create_dir_all(&dir).context("failed to create agent dir")?;
    let when = entry.created_at.unwrap_or_else(Utc::now);
    let mut block = format!("\n---\n\n## {}", when.format("%Y-%m-%d %H:%M"));
    if !entry.task_title.is_empty() {
        block.push_str(&format!(" — {}", entry.task_title));
    }
    block.push_str("\n\n");
    if entry.task_id > 0 {
        block.push_str(&format!("- **Task:** {}\n", entry.task_id));
    }
    if !entry.outcome.is_empty() {
        block.push_str(&format!("- **Outcome:** {}\n", entry.outcome));
    }
    block.push('\n');

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path(&dir))
        .context("failed to open journal")?;
    file.write_all(block.as_bytes()).context("failed to write journal")
}

/// Raw markdown tail of the journal, up to `limit_bytes` (0 = whole file).
pub fn read_journal(team_dir: &Path, agent_name: &str, limit_bytes: usize) -> Result<String> {
    let path = journal_path(&agent_dir(team_dir, agent_name));
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).context("failed to read journal"),
    };
    if limit_bytes == 0 || data.len() <= limit_bytes {
        return Ok(data);
    }
    let cut = data.len() - limit_bytes;
    // Respect char boundaries when slicing the tail.
    let start = (cut..data.len()).find(|i| data.is_char_boundary(*i)).unwrap_or(cut);
    Ok(data[start..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_name_replaces_spaces() {
        assert_eq!(safe_name("my team"), "my_team");
        assert_eq!(safe_name("  padded  name "), "padded__name");
        assert_eq!(safe_name("plain"), "plain");
    }

    #[test]
    fn test_layout_paths() {
        let home = Path::new("/home/u/.agentary");
        let td = team_dir(home, "my team");
        assert_eq!(td, Path::new("/home/u/.agentary/teams/my_team"));
        let ad = agent_dir(&td, "alice smith");
        assert_eq!(ad, td.join("agents/alice_smith"));
        assert_eq!(charter_path(&td), td.join("charter.md"));
        assert_eq!(journal_path(&ad), ad.join("journal.md"));
    }

    #[test]
    fn test_journal_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let td = tmp.path().join("teams/default");
        append_journal(
            &td,
            "alice",
            &JournalEntry {
                task_id: 7,
                task_title: "Fix the flaky test".into(),
                outcome: "done".into(),
                created_at: None,
            },
        )
        .unwrap();

        let journal = read_journal(&td, "alice", 0).unwrap();
        assert!(journal.contains("Fix the flaky test"));
        assert!(journal.contains("- **Task:** 7"));
        assert!(journal.contains("- **Outcome:** done"));
    }

    #[test]
    fn test_journal_missing_file_reads_empty() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_journal(tmp.path(), "ghost", 0).unwrap(), "");
    }

    #[test]
    fn test_charter_round_trip_and_missing() {
        let tmp = TempDir::new().unwrap();
        let td = tmp.path().join("teams/default");
        assert_eq!(read_charter(&td).unwrap(), "");
        write_charter(&td, "# Mission\nShip it.\n").unwrap();
        assert_eq!(read_charter(&td).unwrap(), "# Mission\nShip it.\n");
    }

    #[test]
    fn test_agent_config_round_trip_and_missing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("agents/alice");
        assert!(load_agent_config(&dir).unwrap().is_none());

        save_agent_config(
            &dir,
            &AgentConfig {
                model: Some("claude-sonnet".into()),
                max_tokens: Some(4096),
            },
        )
        .unwrap();
        let cfg = load_agent_config(&dir).unwrap().unwrap();
        assert_eq!(cfg.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(cfg.max_tokens, Some(4096));
    }
}
