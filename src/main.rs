use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use agentary::config::{RuntimeKind, StartOptions};
use agentary::store::Store;
use agentary::{config, daemon};

#[derive(Parser)]
#[command(name = "agentary")]
#[command(version, about = "Autonomous agent fleet orchestrator")]
struct Cli {
    /// Home directory (default: $AGENTARY_HOME or ~/.agentary)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        #[command(flatten)]
        opts: DaemonArgs,
    },
    /// Start the daemon in the background
    Start {
        #[command(flatten)]
        opts: DaemonArgs,
    },
    /// Stop the background daemon
    Stop,
    /// Show daemon status
    Status,
    /// Seed demo data (team, agents, default workflow, welcome task)
    Seed,
}

#[derive(Args, Clone)]
struct DaemonArgs {
    /// HTTP listen port
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Scheduler tick interval in seconds
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Maximum concurrent agent turns
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Agent runtime backend: stub, subprocess, or remote
    #[arg(long, default_value = "stub")]
    runtime: String,

    /// Agent binary for the subprocess runtime
    #[arg(long)]
    subprocess_cmd: Option<String>,

    /// Extra arguments for the agent binary (repeatable)
    #[arg(long = "subprocess-arg")]
    subprocess_args: Vec<String>,

    /// Wall-clock timeout per subprocess turn, in seconds
    #[arg(long)]
    subprocess_timeout: Option<u64>,

    /// Base URL for the remote streaming runtime
    #[arg(long)]
    remote_addr: Option<String>,

    /// Sandbox subprocess agents so only their team directory is writable
    #[arg(long)]
    sandbox: bool,

    /// Merge worker interval in seconds
    #[arg(long, default_value_t = 15.0)]
    merge_interval: f64,

    /// Rebase task branches onto the remote main line before merging
    #[arg(long)]
    rebase_before_merge: bool,

    /// Dev mode (permissive CORS)
    #[arg(long)]
    dev: bool,
}

impl DaemonArgs {
    fn to_options(&self, home: PathBuf) -> Result<StartOptions> {
        let runtime: RuntimeKind =
            self.runtime.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(StartOptions {
            sandbox_home: self.sandbox.then(|| home.clone()),
            home,
            port: self.port,
            tick: Duration::from_secs_f64(self.interval.max(0.1)),
            max_concurrent: self.max_concurrent,
            merge_interval: Duration::from_secs_f64(self.merge_interval.max(1.0)),
            rebase_before_merge: self.rebase_before_merge,
            runtime,
            subprocess_cmd: self.subprocess_cmd.clone(),
            subprocess_args: self.subprocess_args.clone(),
            subprocess_timeout: self.subprocess_timeout.map(Duration::from_secs),
            remote_addr: self.remote_addr.clone(),
            dev: self.dev,
        })
    }

    /// Flags forwarded to the re-exec'd background daemon.
    fn to_forwarded_args(&self) -> Vec<String> {
        let mut args = vec![
            "--port".into(),
            self.port.to_string(),
            "--interval".into(),
            self.interval.to_string(),
            "--max-concurrent".into(),
            self.max_concurrent.to_string(),
            "--runtime".into(),
            self.runtime.clone(),
            "--merge-interval".into(),
            self.merge_interval.to_string(),
        ];
        if let Some(cmd) = &self.subprocess_cmd {
            args.extend(["--subprocess-cmd".into(), cmd.clone()]);
        }
        for arg in &self.subprocess_args {
            args.extend(["--subprocess-arg".into(), arg.clone()]);
        }
        if let Some(timeout) = self.subprocess_timeout {
            args.extend(["--subprocess-timeout".into(), timeout.to_string()]);
        }
        if let Some(addr) = &self.remote_addr {
            args.extend(["--remote-addr".into(), addr.clone()]);
        }
        if self.sandbox {
            args.push("--sandbox".into());
        }
        if self.rebase_before_merge {
            args.push("--rebase-before-merge".into());
        }
        if self.dev {
            args.push("--dev".into());
        }
        args
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(config::default_home);

    match &cli.command {
        Commands::Daemon { opts } => {
            let opts = opts.to_options(home)?;
            daemon::start_foreground(opts).await
        }
        Commands::Start { opts } => {
            let forwarded = opts.to_forwarded_args();
            let opts = opts.to_options(home)?;
            let pid = daemon::start_background(&opts, &forwarded)?;
            println!("agentary started (pid {})", pid);
            Ok(())
        }
        Commands::Stop => {
            if daemon::stop(&home)? {
                println!("agentary stopped");
            } else {
                println!("agentary is not running");
            }
            Ok(())
        }
        Commands::Status => {
            let st = daemon::status(&home);
            if st.running {
                println!(
                    "running (pid {}, addr {})",
                    st.pid.unwrap_or_default(),
                    st.addr.unwrap_or_else(|| "unknown".into())
                );
            } else {
                println!("not running");
            }
            Ok(())
        }
        Commands::Seed => {
            let store = Store::open(&home).context("failed to open store")?;
            store.seed_demo().context("failed to seed demo data")?;
            println!("seeded demo data under {}", home.display());
            Ok(())
        }
    }
}
