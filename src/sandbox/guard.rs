//! Role-scoped filesystem write authorization.

use std::path::{Component, Path, PathBuf};

/// Checks each candidate write path before a tool call touches the
/// filesystem. Writes outside the team directory are denied for every role.
/// Manager may write anywhere under the team directory; engineer only to its
/// own agent directory, the team shared directory, and declared task
/// worktrees.
#[derive(Debug, Clone, Default)]
pub struct WriteGuard {
    pub role: String,
    pub agent_name: String,
    pub team_dir: PathBuf,
    pub worktree_dirs: Vec<PathBuf>,
}

impl WriteGuard {
    pub fn allow_write(&self, path: &Path) -> bool {
        if path.as_os_str().is_empty() || self.team_dir.as_os_str().is_empty() {
            return false;
        }
        let abs = normalize(path);
        let team_dir = normalize(&self.team_dir);
        if !abs.starts_with(&team_dir) {
            return false;
        }
        if self.role == "manager" {
            return true;
        }
        let agent_dir = team_dir.join("agents").join(&self.agent_name);
        if abs.starts_with(&agent_dir) {
            return true;
        }
        if abs.starts_with(team_dir.join("shared")) {
            return true;
        }
        self.worktree_dirs
            .iter()
            .any(|wd| abs.starts_with(normalize(wd)))
    }
}

/// Lexically absolutize and clean a path: resolve against the current
/// directory, drop `.`, and collapse `..`. Purely textual; symlinks are not
/// chased, matching how the paths were recorded.
fn normalize(path: &Path) -> PathBuf {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(role: &str) -> WriteGuard {
        WriteGuard {
            role: role.to_string(),
            agent_name: "alice".to_string(),
            team_dir: PathBuf::from("/home/u/.agentary/teams/default"),
            worktree_dirs: vec![PathBuf::from(
                "/home/u/.agentary/protected/teams/default/worktrees/repo-T3",
            )],
        }
    }

    #[test]
    fn test_outside_team_dir_denied_for_all_roles() {
        assert!(!guard("manager").allow_write(Path::new("/etc/passwd")));
        assert!(!guard("engineer").allow_write(Path::new("/home/u/.agentary/protected/db.sqlite")));
    }

    #[test]
    fn test_manager_writes_anywhere_under_team_dir() {
        let g = guard("manager");
        assert!(g.allow_write(Path::new("/home/u/.agentary/teams/default/charter.md")));
        assert!(g.allow_write(Path::new("/home/u/.agentary/teams/default/agents/bob/journal.md")));
    }

    #[test]
    fn test_engineer_scope() {
        let g = guard("engineer");
        assert!(g.allow_write(Path::new(
            "/home/u/.agentary/teams/default/agents/alice/notes/x.md"
        )));
        assert!(g.allow_write(Path::new("/home/u/.agentary/teams/default/shared/scratch.md")));
        // Another agent's directory is off limits.
        assert!(!g.allow_write(Path::new(
            "/home/u/.agentary/teams/default/agents/bob/journal.md"
        )));
        // Team dir root itself is not in any allowed subtree.
        assert!(!g.allow_write(Path::new("/home/u/.agentary/teams/default/charter.md")));
    }

    #[test]
    fn test_engineer_may_write_declared_worktrees() {
        let g = WriteGuard {
            team_dir: PathBuf::from("/home/u/.agentary/protected/teams/default"),
            ..guard("engineer")
        };
        assert!(g.allow_write(Path::new(
            "/home/u/.agentary/protected/teams/default/worktrees/repo-T3/src/main.rs"
        )));
    }

    #[test]
    fn test_traversal_does_not_escape() {
        let g = guard("engineer");
        assert!(!g.allow_write(Path::new(
            "/home/u/.agentary/teams/default/agents/alice/../../../../../../etc/passwd"
        )));
        // Collapsing inside the allowed subtree is fine.
        assert!(g.allow_write(Path::new(
            "/home/u/.agentary/teams/default/agents/alice/notes/./a.md"
        )));
    }

    #[test]
    fn test_empty_path_denied() {
        assert!(!guard("manager").allow_write(Path::new("")));
    }
}
