use clap::{CommandFactory, Parser};
use color_eyre::eyre::{bail, eyre};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use pm::cli::{Cli, Command, RunArgs};
use pm::discovery::LiveStatus;
use pm::dispatch::{BatchOutcome, Delivery, StopOutcome};
use pm::manager::{LogLine, Manager, ProcessView, StartOutcome};
use pm::paths::Paths;
use pm::record::{ProcessRecord, TAG_ALL};
use pm::store::Store;
use pm::supervisor::Supervisor;
use std::fmt::Display;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const ENV_LOG: &str = "PM_LOG";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    if let Command::Shim { record } = command {
        init_tracing("info");
        return run_shim(&record).await;
    }
    init_tracing("warn");

    let manager = Manager::new(Paths::new()?)?;
    let json = cli.json;

    match command {
        Command::Run(args) => {
            let records = create(&manager, args, json)?;
            report(&records, manager.start(&records), json, describe_start)?;
        }
        Command::Create(args) => {
            create(&manager, args, json)?;
        }
        Command::Start { selectors } => {
            let records = manager.select(&selectors)?;
            report(&records, manager.start(&records), json, describe_start)?;
        }
        Command::Stop { selectors } => {
            let records = manager.select(&selectors)?;
            let outcome = manager.stop(&records).await;
            report(&records, outcome, json, describe_stop)?;
        }
        Command::Restart { selectors } => {
            let records = manager.select(&selectors)?;
            let outcome = manager.restart(&records).await;
            report(&records, outcome, json, describe_start)?;
        }
        Command::Delete { selectors } => {
            let records = manager.select(&selectors)?;
            let outcome = manager.delete(&records).await;
            report(&records, outcome, json, |_| "deleted")?;
        }
        Command::List { selectors } => {
            let views = manager.list(&selectors)?;
            if json {
                println!("{}", serde_json::to_string(&views)?);
            } else {
                print_table(&views);
            }
        }
        Command::Inspect { selectors } => {
            let views = manager.list(&selectors)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                views.iter().for_each(print_detail);
            }
        }
        Command::Signal { signal, selectors } => {
            let signal = pm::sys::parse_signal(&signal)?;
            let records = manager.select(&selectors)?;
            report(&records, manager.signal(&records, signal), json, describe_delivery)?;
        }
        Command::Logs {
            selectors,
            lines,
            follow,
        } => {
            let records = manager.select(&selectors)?;
            for line in manager.tail(&records, lines)? {
                print_log_line(&line, json);
            }
            if follow {
                let stop = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                manager
                    .follow(&records, |line| print_log_line(&line, json), stop)
                    .await?;
            }
        }
        Command::Shim { .. } => unreachable!("shim is handled before the manager is opened"),
    }

    Ok(())
}

fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_shim(record_json: &str) -> color_eyre::Result<()> {
    let record: ProcessRecord = serde_json::from_str(record_json)?;
    let paths = Paths::new()?;
    let store = match Store::open(paths.db_dir()) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "store unavailable, status will not be recorded");
            None
        }
    };

    let report = Supervisor::new(record, store).await?.run().await?;
    tracing::info!(
        launches = report.launches,
        triggers = report.triggers,
        last_exit_code = ?report.last_exit_code,
        "supervisor finished"
    );
    Ok(())
}

fn create(manager: &Manager, args: RunArgs, json: bool) -> color_eyre::Result<Vec<ProcessRecord>> {
    let records = match args.config.clone() {
        Some(path) => manager.create_from_file(&path)?,
        None => {
            let config = args
                .into_process_config()
                .ok_or_else(|| eyre!("missing command, expected: pm run [OPTIONS] -- CMD [ARGS]..."))?;
            vec![manager.create(config)?]
        }
    };

    if json {
        println!("{}", serde_json::to_string(&records)?);
    } else {
        for record in &records {
            let msg = format!("created: {} ({})", record.name, record.id.short());
            println!("{}", msg.green());
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Batch reporting
// ---------------------------------------------------------------------------

fn describe_start(outcome: &StartOutcome) -> &'static str {
    match outcome {
        StartOutcome::Started { .. } => "started",
        StartOutcome::AlreadyRunning => "already running",
    }
}

fn describe_stop(outcome: &StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::AlreadyStopped => "already stopped",
        StopOutcome::Stopped => "stopped",
        StopOutcome::Killed => "killed",
    }
}

fn describe_delivery(outcome: &Delivery) -> &'static str {
    match outcome {
        Delivery::Sent => "signalled",
        Delivery::Skipped => "skipped, no child running",
    }
}

fn report<T, E: Display>(
    records: &[ProcessRecord],
    outcome: BatchOutcome<T, E>,
    json: bool,
    describe: impl Fn(&T) -> &'static str,
) -> color_eyre::Result<()> {
    let name_of = |id: &pm::record::Pmid| {
        records
            .iter()
            .find(|r| r.id == *id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.short().to_string())
    };

    let total = outcome.results.len();
    let failures = outcome.failures();
    let mut rows = Vec::with_capacity(total);
    for (id, result) in &outcome.results {
        let name = name_of(id);
        match result {
            Ok(value) if json => rows.push(serde_json::json!({
                "id": id, "name": name, "ok": true, "result": describe(value),
            })),
            Err(e) if json => rows.push(serde_json::json!({
                "id": id, "name": name, "ok": false, "error": e.to_string(),
            })),
            Ok(value) => println!("{}", format!("{}: {name}", describe(value)).green()),
            Err(e) => eprintln!("{} {name}: {e}", "error:".red().bold()),
        }
    }
    if json {
        println!("{}", serde_json::Value::Array(rows));
    }

    if failures > 0 {
        bail!("{failures} of {total} operation(s) failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn status_color(status: LiveStatus) -> Color {
    match status {
        LiveStatus::Running => Color::Green,
        LiveStatus::Created => Color::Yellow,
        LiveStatus::Stopped => Color::Reset,
    }
}

fn user_tags(record: &ProcessRecord) -> String {
    let tags: Vec<&str> = record
        .tags
        .iter()
        .map(String::as_str)
        .filter(|t| *t != TAG_ALL)
        .collect();
    if tags.is_empty() {
        "-".to_string()
    } else {
        tags.join(",")
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn print_table(views: &[ProcessView]) {
    if views.is_empty() {
        println!("{}", "no processes".yellow());
        return;
    }

    let now = now_ms();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(
        ["name", "id", "status", "pid", "child", "cpu", "mem", "uptime", "tags"]
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
    );
    for view in views {
        let stat = view.stat.as_ref();
        let pid = |p: Option<u32>| p.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&view.record.name).fg(Color::Cyan),
            Cell::new(view.record.id.short()),
            Cell::new(view.live.to_string()).fg(status_color(view.live)),
            Cell::new(pid(stat.map(|s| s.supervisor_pid))),
            Cell::new(pid(stat.and_then(|s| s.child_pid))),
            Cell::new(format_cpu(stat.filter(|s| s.child_pid.is_some()).map(|s| s.cpu_percent))),
            Cell::new(format_memory_bytes(
                stat.filter(|s| s.child_pid.is_some()).map(|s| s.memory_bytes),
            )),
            Cell::new(format_uptime(view.uptime_secs(now))),
            Cell::new(user_tags(&view.record)).fg(Color::Magenta),
        ]);
    }
    println!("{table}");
}

fn print_detail(view: &ProcessView) {
    let record = &view.record;
    let status = view.live.to_string();
    let colored_status = match view.live {
        LiveStatus::Running => status.green().to_string(),
        LiveStatus::Created => status.yellow().to_string(),
        LiveStatus::Stopped => status,
    };
    println!("{}: {}", record.name.cyan().bold(), colored_status);
    println!("  {} {}", "id:".dimmed(), record.id);
    println!(
        "  {} {}",
        "command:".dimmed(),
        shell_words::join(std::iter::once(&record.command).chain(&record.args))
    );
    println!("  {} {}", "cwd:".dimmed(), record.cwd.display());
    println!("  {} {}", "last marker:".dimmed(), record.status);
    println!("  {} {}", "tags:".dimmed(), user_tags(record));
    if let Some(watch) = &record.watch {
        println!("  {} {watch}", "watch:".dimmed());
    }
    println!("  {} {}", "max restarts:".dimmed(), record.max_restarts);
    println!("  {} {}ms", "kill timeout:".dimmed(), record.kill_timeout_ms);
    if let Some(stat) = &view.stat {
        println!("  {} {}", "supervisor pid:".dimmed(), stat.supervisor_pid);
        if let Some(child) = stat.child_pid {
            println!("  {} {child}", "child pid:".dimmed());
            println!("  {} {}", "cpu:".dimmed(), format_cpu(Some(stat.cpu_percent)));
            println!(
                "  {} {}",
                "memory:".dimmed(),
                format_memory_bytes(Some(stat.memory_bytes))
            );
            println!(
                "  {} {}",
                "uptime:".dimmed(),
                format_uptime(view.uptime_secs(now_ms()))
            );
        }
    }
    if !record.env.is_empty() {
        println!("  {}", "env:".dimmed());
        for (k, v) in &record.env {
            println!("    {k}={v}");
        }
    }
    println!("  {} {}", "stdout_log:".dimmed(), record.stdout_file.display());
    println!("  {} {}", "stderr_log:".dimmed(), record.stderr_file.display());
}

fn print_log_line(line: &LogLine, json: bool) {
    if json {
        if let Ok(s) = serde_json::to_string(line) {
            println!("{s}");
        }
    } else if line.stream == "stderr" {
        println!("{} {}", format!("[{}]", line.name).red().bold(), line.line);
    } else {
        println!("{} {}", format!("[{}]", line.name).cyan().bold(), line.line);
    }
}

fn format_cpu(cpu: Option<f64>) -> String {
    match cpu {
        Some(v) => format!("{v:.1}%"),
        None => "-".to_string(),
    }
}

fn format_memory_bytes(bytes: Option<u64>) -> String {
    match bytes {
        None => "-".to_string(),
        Some(b) if b < 1024 => format!("{b}B"),
        Some(b) if b < 1024 * 1024 => format!("{:.1}K", b as f64 / 1024.0),
        Some(b) if b < 1024 * 1024 * 1024 => format!("{:.1}M", b as f64 / (1024.0 * 1024.0)),
        Some(b) => format!("{:.1}G", b as f64 / (1024.0 * 1024.0 * 1024.0)),
    }
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}
