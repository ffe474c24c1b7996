//! Daemon lifecycle: singleton lock, pid/addr files, component wiring, and
//! graceful shutdown. One process per home directory holds an exclusive
//! OS-level lock on `protected/daemon.lock`; a second start fails fast.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::watch;
use tracing::info;

use crate::config::{self, RuntimeKind, StartOptions};
use crate::events::EventHub;
use crate::manager;
use crate::merge::MergeWorker;
use crate::runtime::{AgentRuntime, RemoteRuntime, StubRuntime, SubprocessRuntime};
use crate::scheduler::Scheduler;
use crate::server::{self, AppState};
use crate::store::{Store, StoreHandle};

pub fn protected_dir(home: &Path) -> PathBuf {
    home.join("protected")
}

pub fn pid_path(home: &Path) -> PathBuf {
    protected_dir(home).join("daemon.pid")
}

pub fn addr_path(home: &Path) -> PathBuf {
    protected_dir(home).join("daemon.addr")
}

pub fn lock_path(home: &Path) -> PathBuf {
    protected_dir(home).join("daemon.lock")
}

pub fn log_path(home: &Path) -> PathBuf {
    protected_dir(home).join("daemon.log")
}

/// Exclusive singleton lock, held for the daemon's lifetime.
#[derive(Debug)]
struct DaemonLock {
    file: std::fs::File,
}

impl DaemonLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|_| anyhow::anyhow!("agentary is already running (lock held)"))?;
        Ok(Self { file })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn build_runtime(opts: &StartOptions) -> Result<Arc<dyn AgentRuntime>> {
    match opts.runtime {
        RuntimeKind::Stub => Ok(Arc::new(StubRuntime)),
        RuntimeKind::Subprocess => {
            let command = opts
                .subprocess_cmd
                .clone()
                .context("--subprocess-cmd is required for the subprocess runtime")?;
            Ok(Arc::new(SubprocessRuntime {
                command,
                args: opts.subprocess_args.clone(),
                timeout: opts.subprocess_timeout,
                sandbox_home: opts.sandbox_home.clone(),
            }))
        }
        RuntimeKind::Remote => {
            let addr = opts
                .remote_addr
                .clone()
                .context("--remote-addr is required for the remote runtime")?;
            Ok(Arc::new(RemoteRuntime::new(&addr)))
        }
    }
}

fn open_store(home: &Path) -> Result<Store> {
    match std::env::var(config::DB_ENV) {
        Ok(path) if !path.is_empty() => Store::open_path(Path::new(&path)),
        _ => Store::open(home),
    }
}

/// Run the daemon in the foreground until SIGTERM/ctrl-c. Startup errors
/// (lock, store, listen address) are fatal and propagate with a clear
/// message; everything after startup is recoverable and logged.
pub async fn start_foreground(opts: StartOptions) -> Result<()> {
    std::fs::create_dir_all(protected_dir(&opts.home)).context("failed to create protected dir")?;
    let _lock = DaemonLock::acquire(&lock_path(&opts.home))?;

    let store = open_store(&opts.home).context("failed to open store")?;
    store.seed_demo().context("failed to seed demo data")?;
    let store = StoreHandle::new(store);

    let pid = std::process::id();
    std::fs::write(pid_path(&opts.home), format!("{}\n", pid)).context("failed to write pid file")?;
    let addr: SocketAddr = ([0, 0, 0, 0], opts.port).into();
    let _ = std::fs::write(addr_path(&opts.home), format!("{}\n", addr));

    let hub = Arc::new(EventHub::new());
    let runtime = build_runtime(&opts)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        hub.clone(),
        runtime,
        Some(opts.home.clone()),
        opts.tick,
        opts.max_concurrent,
    ));
    workers.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    let merge_worker = MergeWorker {
        store: store.clone(),
        hub: hub.clone(),
        interval: opts.merge_interval,
        rebase_before_merge: opts.rebase_before_merge,
    };
    workers.push(tokio::spawn(merge_worker.run(shutdown_rx.clone())));

    // Manager: LLM-backed when an endpoint is configured, rule-based otherwise.
    let llm_url = std::env::var(config::LLM_URL_ENV).unwrap_or_default();
    let llm_key = std::env::var(config::LLM_KEY_ENV).unwrap_or_default();
    if !llm_url.is_empty() && !llm_key.is_empty() {
        let llm_opts = manager::llm::LlmOpts {
            base_url: llm_url,
            api_key: llm_key,
            model: std::env::var(config::LLM_MODEL_ENV)
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| config::DEFAULT_LLM_MODEL.to_string()),
        };
        workers.push(tokio::spawn(manager::llm::run(
            store.clone(),
            hub.clone(),
            llm_opts,
            shutdown_rx.clone(),
        )));
    } else {
        workers.push(tokio::spawn(manager::run(
            store.clone(),
            hub.clone(),
            shutdown_rx.clone(),
        )));
    }
    workers.push(tokio::spawn(manager::poll_inbox(
        store.clone(),
        hub.clone(),
        manager::MANAGER_RECIPIENT.to_string(),
        manager::INBOX_POLL_INTERVAL,
        shutdown_rx.clone(),
    )));

    // Signals flip the shutdown switch; every loop observes it.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            let _ = shutdown_tx.send(true);
        });
    }

    let state: Arc<AppState> = Arc::new(AppState {
        store,
        hub,
        home: opts.home.clone(),
        api_key: std::env::var(config::API_KEY_ENV).ok().filter(|k| !k.is_empty()),
        dev: opts.dev,
    });
    info!(%addr, home = %opts.home.display(), "daemon starting");
    let serve_result = server::serve(state, addr, shutdown_rx).await;

    // Bounded grace window for in-flight turns after the server stops.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(
        Duration::from_secs(15),
        futures_util::future::join_all(workers),
    )
    .await;

    let _ = std::fs::remove_file(pid_path(&opts.home));
    let _ = std::fs::remove_file(addr_path(&opts.home));
    serve_result
}

#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub addr: Option<String>,
}

fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

pub fn status(home: &Path) -> DaemonStatus {
    let pid = std::fs::read_to_string(pid_path(home))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    let Some(pid) = pid else {
        return DaemonStatus::default();
    };
    if !process_exists(pid) {
        // Stale pid file from an unclean exit.
        let _ = std::fs::remove_file(pid_path(home));
        return DaemonStatus::default();
    }
    let addr = std::fs::read_to_string(addr_path(home))
        .ok()
        .map(|s| s.trim().to_string());
    DaemonStatus {
        running: true,
        pid: Some(pid),
        addr,
    }
}

/// Re-exec the binary detached, with stderr appended to the daemon log.
/// Returns the child pid once the daemon reports itself running.
pub fn start_background(opts: &StartOptions, extra_args: &[String]) -> Result<u32> {
    std::fs::create_dir_all(protected_dir(&opts.home)).context("failed to create protected dir")?;
    let st = status(&opts.home);
    if st.running {
        anyhow::bail!("agentary already running (pid {})", st.pid.unwrap_or_default());
    }

    let exe = std::env::current_exe().context("failed to resolve executable path")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(&opts.home))
        .context("failed to open daemon log")?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon")
        .arg("--home")
        .arg(&opts.home)
        .args(extra_args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(log);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn().context("failed to spawn daemon")?;

    // Wait briefly for the pid file to appear or the child to die.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        let st = status(&opts.home);
        if st.running {
            return Ok(st.pid.unwrap_or(child.id()));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(child.id())
}

/// SIGTERM the recorded daemon, wait for exit, SIGKILL as a last resort.
/// Returns false when nothing was running.
pub fn stop(home: &Path) -> Result<bool> {
    let st = status(home);
    let Some(pid) = st.pid.filter(|_| st.running) else {
        return Ok(false);
    };
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        while std::time::Instant::now() < deadline {
            if !process_exists(pid) {
                let _ = std::fs::remove_file(pid_path(home));
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        let _ = std::fs::remove_file(pid_path(home));
        Ok(true)
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stop is only supported on unix hosts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_singleton_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(protected_dir(tmp.path())).unwrap();
        let path = lock_path(tmp.path());

        let first = DaemonLock::acquire(&path).unwrap();
        let second = DaemonLock::acquire(&path);
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("already running"));

        drop(first);
        DaemonLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_status_with_no_pid_file() {
        let tmp = TempDir::new().unwrap();
        let st = status(tmp.path());
        assert!(!st.running);
        assert!(st.pid.is_none());
    }

    #[test]
    fn test_status_cleans_stale_pid_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(protected_dir(tmp.path())).unwrap();
        // A pid that cannot exist on Linux (beyond pid_max).
        std::fs::write(pid_path(tmp.path()), "4194305\n").unwrap();
        let st = status(tmp.path());
        assert!(!st.running);
        assert!(!pid_path(tmp.path()).exists());
    }

    #[test]
    fn test_stop_when_not_running() {
        let tmp = TempDir::new().unwrap();
        assert!(!stop(tmp.path()).unwrap());
    }

    #[test]
    fn test_protected_layout() {
        let home = Path::new("/h");
        assert_eq!(pid_path(home), Path::new("/h/protected/daemon.pid"));
        assert_eq!(lock_path(home), Path::new("/h/protected/daemon.lock"));
        assert_eq!(log_path(home), Path::new("/h/protected/daemon.log"));
    }
}
