use std::path::PathBuf;
use std::time::Duration;

/// Environment variables consumed by the daemon and its runtimes.
pub const HOME_ENV: &str = "AGENTARY_HOME";
pub const API_KEY_ENV: &str = "AGENTARY_API_KEY";
pub const DB_ENV: &str = "AGENTARY_DB";
pub const LLM_URL_ENV: &str = "AGENTARY_LLM_URL";
pub const LLM_KEY_ENV: &str = "OPENAI_API_KEY";
pub const LLM_MODEL_ENV: &str = "AGENTARY_LLM_MODEL";
/// Exported to subprocess agents as a comma-separated host list.
pub const ALLOWLIST_ENV: &str = "AGENTARY_NETWORK_ALLOWLIST";

pub const DEFAULT_PORT: u16 = 3548;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONCURRENT: usize = 32;
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Home directory: `$AGENTARY_HOME`, else `~/.agentary`.
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentary")
}

/// Which runtime backend executes agent turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeKind {
    #[default]
    Stub,
    Subprocess,
    Remote,
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stub" | "" => Ok(Self::Stub),
            "subprocess" => Ok(Self::Subprocess),
            "remote" => Ok(Self::Remote),
            _ => Err(format!("invalid runtime: {} (stub, subprocess, remote)", s)),
        }
    }
}

/// Daemon start configuration, resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub home: PathBuf,
    pub port: u16,
    pub tick: Duration,
    pub max_concurrent: usize,
    pub merge_interval: Duration,
    pub rebase_before_merge: bool,
    pub runtime: RuntimeKind,
    pub subprocess_cmd: Option<String>,
    pub subprocess_args: Vec<String>,
    pub subprocess_timeout: Option<Duration>,
    pub remote_addr: Option<String>,
    /// When set, subprocess agents run inside the namespace sandbox rooted
    /// here (normally the home directory).
    pub sandbox_home: Option<PathBuf>,
    pub dev: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            home: default_home(),
            port: DEFAULT_PORT,
            tick: DEFAULT_TICK,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            merge_interval: DEFAULT_MERGE_INTERVAL,
            rebase_before_merge: false,
            runtime: RuntimeKind::Stub,
            subprocess_cmd: None,
            subprocess_args: Vec::new(),
            subprocess_timeout: None,
            remote_addr: None,
            sandbox_home: None,
            dev: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_runtime_kind_parsing() {
        assert_eq!(RuntimeKind::from_str("stub").unwrap(), RuntimeKind::Stub);
        assert_eq!(
            RuntimeKind::from_str("subprocess").unwrap(),
            RuntimeKind::Subprocess
        );
        assert_eq!(RuntimeKind::from_str("remote").unwrap(), RuntimeKind::Remote);
        assert!(RuntimeKind::from_str("docker").is_err());
    }

    #[test]
    fn test_default_options() {
        let opts = StartOptions::default();
        assert_eq!(opts.port, DEFAULT_PORT);
        assert_eq!(opts.max_concurrent, 32);
        assert_eq!(opts.tick, Duration::from_secs(1));
        assert_eq!(opts.merge_interval, Duration::from_secs(15));
    }
}
