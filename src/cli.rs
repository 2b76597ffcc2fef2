use crate::config::{ProcessConfig, parse_env_pair};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pm", about = "A daemonless process manager", version)]
pub struct Cli {
    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Args, Default)]
pub struct RunArgs {
    /// Name of the process (defaults to `<command>-<id>`)
    #[arg(long)]
    pub name: Option<String>,
    /// Working directory (defaults to the current one)
    #[arg(long)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variable, KEY=VALUE
    #[arg(long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
    /// Tag used to select processes in bulk
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Relaunch when a file under cwd whose relative path matches this regex changes
    #[arg(long)]
    pub watch: Option<String>,
    /// How many times a process that exits on its own is launched again
    #[arg(long)]
    pub max_restarts: Option<u32>,
    /// Milliseconds between SIGTERM and SIGKILL when stopping
    #[arg(long)]
    pub kill_timeout: Option<u64>,
    /// Process file (TOML) describing one or more processes
    #[arg(long, conflicts_with_all = ["name", "cwd", "env", "tags", "watch", "max_restarts", "kill_timeout", "command"])]
    pub config: Option<PathBuf>,
    /// Command to run and its arguments
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// `None` when a config file was given instead of a command.
    pub fn into_process_config(self) -> Option<ProcessConfig> {
        let mut words = self.command.into_iter();
        let command = words.next()?;
        Some(ProcessConfig {
            name: self.name,
            command,
            args: words.collect(),
            cwd: self.cwd,
            env: self.env.into_iter().collect(),
            tags: self.tags,
            watch: self.watch,
            max_restarts: self.max_restarts,
            kill_timeout: self.kill_timeout,
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create (or update) a process and start it
    Run(RunArgs),
    /// Create (or update) a process without starting it
    Create(RunArgs),
    /// Start processes
    Start { selectors: Vec<String> },
    /// Stop running processes
    Stop { selectors: Vec<String> },
    /// Stop, then start processes
    Restart { selectors: Vec<String> },
    /// Stop processes and remove them with their logs
    #[command(visible_alias = "rm")]
    Delete { selectors: Vec<String> },
    /// List managed processes
    #[command(visible_alias = "ls")]
    List { selectors: Vec<String> },
    /// Show everything known about processes
    Inspect {
        #[arg(required = true)]
        selectors: Vec<String>,
    },
    /// Send a signal to processes
    Signal {
        signal: String,
        selectors: Vec<String>,
    },
    /// View process logs
    Logs {
        selectors: Vec<String>,
        #[arg(long, default_value_t = 15)]
        lines: usize,
        #[arg(short, long)]
        follow: bool,
    },
    /// Supervise one process (internal)
    #[command(hide = true)]
    Shim { record: String },
}
