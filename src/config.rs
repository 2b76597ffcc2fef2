use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// What a user asks for when creating a process, from the command line or a
/// process file. Turned into a stored record by the manager.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessConfig {
    pub name: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub watch: Option<String>,
    pub max_restarts: Option<u32>,
    pub kill_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawProcessConfig {
    command: String,
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    tags: Vec<String>,
    watch: Option<String>,
    max_restarts: Option<u32>,
    kill_timeout: Option<u64>,
    #[serde(flatten)]
    extra: HashMap<String, toml::Value>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("unknown field `{field}` in process `{process}`")]
    UnknownField { process: String, field: String },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("{0}")]
    IoError(String),
}

/// Splits a shell-style command line into program and arguments.
pub fn parse_command(command: &str) -> Result<(String, Vec<String>), ConfigError> {
    let mut words = shell_words::split(command)
        .map_err(|e| ConfigError::InvalidCommand(format!("failed to parse: {e}")))?
        .into_iter();
    let Some(program) = words.next() else {
        return Err(ConfigError::InvalidCommand("command is empty".to_string()));
    };
    Ok((program, words.collect()))
}

/// `KEY=VALUE` as typed after `--env`.
pub fn parse_env_pair(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{pair}`")),
    }
}

pub fn load_config(path: &Path) -> Result<Vec<ProcessConfig>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    let base = path.parent().unwrap_or(Path::new("."));
    parse_config(&content, base)
}

/// Relative `cwd` values are resolved against `base`. Processes come back in
/// name order.
pub fn parse_config(content: &str, base: &Path) -> Result<Vec<ProcessConfig>, ConfigError> {
    let table: BTreeMap<String, toml::Value> =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    if table.is_empty() {
        return Err(ConfigError::Empty);
    }

    let mut configs = Vec::with_capacity(table.len());
    for (name, value) in table {
        let raw: RawProcessConfig = value
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::TomlParse(format!("[{name}] {e}")))?;

        if let Some(field) = raw.extra.keys().min() {
            return Err(ConfigError::UnknownField {
                process: name,
                field: field.clone(),
            });
        }

        let (command, args) = parse_command(&raw.command)?;
        let cwd = raw.cwd.map(|cwd| {
            let cwd = PathBuf::from(cwd);
            if cwd.is_relative() { base.join(cwd) } else { cwd }
        });

        configs.push(ProcessConfig {
            name: Some(name),
            command,
            args,
            cwd,
            env: raw.env,
            tags: raw.tags,
            watch: raw.watch,
            max_restarts: raw.max_restarts,
            kill_timeout: raw.kill_timeout,
        });
    }

    Ok(configs)
}
