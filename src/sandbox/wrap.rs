//! Best-effort process isolation via bubblewrap.

use std::path::{Path, PathBuf};

use tokio::process::Command;

/// Wrap `binary args...` in a minimal bwrap sandbox when the host offers one.
///
/// With only `home`, the whole home is writable. With `team_dir` (which must
/// sit under `home`), the home (including `protected/`) is read-only and
/// only the team directory is writable. `/usr`, `/lib`, `/lib64` are bound
/// read-only, `/tmp` is a private tmpfs, `/proc` is mounted, and PIDs are
/// unshared. Falls back to running the binary directly when bwrap is missing
/// or the platform has no namespace support.
pub fn wrap_command(home: &Path, team_dir: Option<&Path>, binary: &str, args: &[String]) -> Command {
    let plain = || {
        let mut c = Command::new(binary);
        c.args(args);
        c
    };
    if !cfg!(target_os = "linux") {
        return plain();
    }
    let Some(bwrap) = find_in_path("bwrap") else {
        return plain();
    };
    let home = match std::path::absolute(home) {
        Ok(p) => p,
        Err(_) => return plain(),
    };

    let mut bwrap_args: Vec<String> = Vec::new();
    let team_dir = team_dir
        .and_then(|t| std::path::absolute(t).ok())
        .filter(|t| t.starts_with(&home) && t != &home);
    match team_dir {
        Some(team) => {
            bwrap_args.extend([
                "--ro-bind".into(),
                home.display().to_string(),
                home.display().to_string(),
                "--bind".into(),
                team.display().to_string(),
                team.display().to_string(),
            ]);
        }
        None => {
            bwrap_args.extend([
                "--bind".into(),
                home.display().to_string(),
                home.display().to_string(),
            ]);
        }
    }
    for dir in ["/usr", "/lib", "/lib64"] {
        bwrap_args.extend(["--ro-bind".into(), dir.into(), dir.into()]);
    }
    bwrap_args.extend([
        "--dev".into(),
        "/dev".into(),
        "--proc".into(),
        "/proc".into(),
        "--tmpfs".into(),
        "/tmp".into(),
        "--unshare-pid".into(),
        "--".into(),
        binary.into(),
    ]);
    bwrap_args.extend(args.iter().cloned());

    let mut c = Command::new(bwrap);
    c.args(&bwrap_args);
    c
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_path_locates_sh() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-binary-xyz").is_none());
    }

    #[test]
    fn test_wrap_falls_back_without_bwrap() {
        // Whatever the host, the wrapped command must be spawnable; the
        // weakest guarantee we can assert portably is that construction
        // succeeds for a relative team dir outside the home (which is
        // rejected and falls back to a plain bind or plain command).
        let cmd = wrap_command(
            Path::new("/tmp/agentary-home"),
            Some(Path::new("/elsewhere/team")),
            "echo",
            &["hi".to_string()],
        );
        // A tokio Command has no public accessors; reaching here without
        // panicking is the contract.
        drop(cmd);
    }
}
