//! Git plumbing for per-task worktrees: naming, creation, rebase, merge,
//! test execution, and cleanup. Topology-changing git is daemon-only; agents
//! are barred from these subcommands by the sandbox deny-list.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::memory::safe_name;

/// Branch for a task: `agentary/<team_id>/<team-with-spaces-as-dashes>/T<id>`.
pub fn branch_name(team_id: &str, team_name: &str, task_id: i64) -> String {
    let safe = team_name.replace(' ', "-");
    format!("agentary/{}/{}/T{}", team_id, safe, task_id)
}

/// Worktree location under the home:
/// `<home>/protected/teams/<safe_team>/worktrees/<safe_repo>-T<id>`.
pub fn worktree_path(home: &Path, team_name: &str, repo_name: &str, task_id: i64) -> PathBuf {
    home.join("protected")
        .join("teams")
        .join(safe_name(team_name))
        .join("worktrees")
        .join(format!("{}-T{}", safe_name(repo_name), task_id))
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {}: {}{}", args.join(" "), stdout, stderr.trim());
    }
    Ok(stdout)
}

/// Clone `source` into `worktree` and check out a fresh `branch`, returning
/// the base commit SHA. Idempotent: an existing worktree directory is left
/// alone and its current HEAD is returned.
pub async fn create_worktree(worktree: &Path, source: &str, branch: &str) -> Result<String> {
    if worktree.as_os_str().is_empty() || source.is_empty() || branch.is_empty() {
        anyhow::bail!("worktree path, source, and branch name required");
    }
    if let Some(parent) = worktree.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("failed to create worktrees dir")?;
    }

    if worktree.exists() {
        let head = git(worktree, &["rev-parse", "HEAD"]).await?;
        return Ok(head.trim().to_string());
    }

    let worktree_str = worktree
        .to_str()
        .context("worktree path contains invalid UTF-8")?;
    // Shallow clone to save space; run from the parent so relative sources
    // resolve against a stable directory.
    let parent = worktree.parent().unwrap_or_else(|| Path::new("."));
    if let Err(e) = git(parent, &["clone", "--depth", "1", source, worktree_str]).await {
        return Err(e).context("git clone failed");
    }
    if let Err(e) = git(worktree, &["checkout", "-b", branch]).await {
        let _ = tokio::fs::remove_dir_all(worktree).await;
        return Err(e).context("git checkout -b failed");
    }
    let head = git(worktree, &["rev-parse", "HEAD"]).await?;
    Ok(head.trim().to_string())
}

/// Remove the worktree directory. No-op when the path is empty or missing.
pub async fn delete_worktree(worktree: &Path) -> Result<()> {
    if worktree.as_os_str().is_empty() || !worktree.exists() {
        return Ok(());
    }
    tokio::fs::remove_dir_all(worktree)
        .await
        .context("failed to remove worktree")
}

/// Check out the branch, fetch, and rebase onto origin/main (falling back to
/// origin/master). No-op when the worktree or branch is unset.
pub async fn rebase_onto_main(worktree: &Path, branch: &str) -> Result<()> {
    if worktree.as_os_str().is_empty() || branch.is_empty() {
        return Ok(());
    }
    git(worktree, &["checkout", branch]).await?;
    git(worktree, &["fetch", "origin"]).await?;
    if git(worktree, &["rebase", "origin/main"]).await.is_err() {
        git(worktree, &["rebase", "origin/master"])
            .await
            .context("rebase onto origin/main failed")?;
    }
    Ok(())
}

/// Merge the task branch into the main line within the worktree (main,
/// falling back to master).
pub async fn merge_in_worktree(worktree: &Path, branch: &str) -> Result<()> {
    if worktree.as_os_str().is_empty() || branch.is_empty() {
        return Ok(());
    }
    if git(worktree, &["checkout", "main"]).await.is_err() {
        git(worktree, &["checkout", "master"])
            .await
            .context("checkout main/master failed")?;
    }
    git(worktree, &["merge", branch])
        .await
        .with_context(|| format!("merge of {} failed", branch))?;
    Ok(())
}

/// Run the repo's test command in the worktree under `sh -c`.
pub async fn run_test_cmd(worktree: &Path, test_cmd: &str) -> Result<()> {
    if worktree.as_os_str().is_empty() || test_cmd.is_empty() {
        return Ok(());
    }
    let output = Command::new("sh")
        .args(["-c", test_cmd])
        .current_dir(worktree)
        .output()
        .await
        .context("failed to run test command")?;
    if !output.status.success() {
        anyhow::bail!(
            "test command failed: {}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// `git diff <base>..<head>` in the worktree, for the review surface.
pub async fn diff(worktree: &Path, base_sha: &str, head_ref: &str) -> Result<String> {
    if worktree.as_os_str().is_empty() {
        return Ok(String::new());
    }
    let head = if head_ref.is_empty() { "HEAD" } else { head_ref };
    let base = if base_sha.is_empty() { "HEAD~1" } else { base_sha };
    let range = format!("{}..{}", base, head);
    git(worktree, &["diff", &range]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_branch_name_format() {
        assert_eq!(
            branch_name("abc123", "my team", 42),
            "agentary/abc123/my-team/T42"
        );
    }

    #[test]
    fn test_worktree_path_format() {
        let p = worktree_path(Path::new("/h"), "my team", "web app", 7);
        assert_eq!(
            p,
            Path::new("/h/protected/teams/my_team/worktrees/web_app-T7")
        );
    }

    async fn run_git(dir: &Path, args: Vec<&str>) {
        let out = Command::new("git")
            .args(&args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        assert!(out.status.success(), "git {:?}: {:?}", args, out);
    }

    async fn init_source_repo(dir: &Path) {
        run_git(dir, vec!["init", "-b", "main"]).await;
        run_git(dir, vec!["config", "user.email", "test@example.com"]).await;
        run_git(dir, vec!["config", "user.name", "test"]).await;
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        run_git(dir, vec!["add", "."]).await;
        run_git(dir, vec!["commit", "-m", "init"]).await;
    }

    #[tokio::test]
    async fn test_create_worktree_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        tokio::fs::create_dir_all(&source).await.unwrap();
        init_source_repo(&source).await;

        let wt = tmp.path().join("worktrees/repo-T1");
        let sha = create_worktree(&wt, source.to_str().unwrap(), "agentary/x/t/T1")
            .await
            .unwrap();
        assert!(!sha.is_empty());
        assert!(wt.join("README.md").exists());

        // Second call returns the same HEAD without re-cloning.
        let again = create_worktree(&wt, source.to_str().unwrap(), "agentary/x/t/T1")
            .await
            .unwrap();
        assert_eq!(sha, again);

        delete_worktree(&wt).await.unwrap();
        assert!(!wt.exists());
        // Deleting a missing worktree is a no-op.
        delete_worktree(&wt).await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_branch_into_main() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        tokio::fs::create_dir_all(&source).await.unwrap();
        init_source_repo(&source).await;

        let wt = tmp.path().join("worktrees/repo-T2");
        create_worktree(&wt, source.to_str().unwrap(), "task-branch")
            .await
            .unwrap();
        git(&wt, &["config", "user.email", "test@example.com"]).await.unwrap();
        git(&wt, &["config", "user.name", "test"]).await.unwrap();

        // Commit a change on the task branch, then merge it back to main.
        tokio::fs::write(wt.join("feature.txt"), "new\n").await.unwrap();
        git(&wt, &["add", "."]).await.unwrap();
        git(&wt, &["commit", "-m", "feature"]).await.unwrap();

        merge_in_worktree(&wt, "task-branch").await.unwrap();
        let log = git(&wt, &["log", "--oneline"]).await.unwrap();
        assert!(log.contains("feature"));
    }

    #[tokio::test]
    async fn test_run_test_cmd_propagates_failure() {
        let tmp = TempDir::new().unwrap();
        run_test_cmd(tmp.path(), "true").await.unwrap();
        assert!(run_test_cmd(tmp.path(), "exit 1").await.is_err());
        // Empty command is a no-op.
        run_test_cmd(tmp.path(), "").await.unwrap();
    }
}
