use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BLOCKED_COMMANDS: &str = "sudo,su,mkfs,fdisk,dd,reboot,shutdown,poweroff,halt";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub blocked_commands: Vec<Regex>,
    pub history_capacity: usize,
    pub max_pipeline_stages: usize,
    pub pipeline_timeout: Duration,
    pub fg_timeout: Duration,
    pub multiwatch_timeout: Duration,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    pub max_capture_bytes: usize,
    pub sink_dir: PathBuf,
    pub command_log_file: Option<PathBuf>,
    pub command_log_max_size_bytes: u64,
    pub display_columns: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            blocked_commands: compile_blocked_commands(DEFAULT_BLOCKED_COMMANDS)
                .unwrap_or_default(),
            history_capacity: 10_000,
            max_pipeline_stages: 16,
            pipeline_timeout: Duration::from_millis(10_000),
            fg_timeout: Duration::from_millis(30_000),
            multiwatch_timeout: Duration::from_millis(300_000),
            kill_grace: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            max_capture_bytes: 1024 * 1024,
            sink_dir: std::env::temp_dir(),
            command_log_file: None,
            command_log_max_size_bytes: 10 * 1024 * 1024,
            display_columns: 80,
        }
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

/// Builds the denylist. A pattern matches the command name when it is the first
/// word, possibly preceded by `VAR=value` assignments.
pub fn compile_blocked_commands(list: &str) -> Result<Vec<Regex>> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            Regex::new(&format!(
                r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
                regex::escape(s)
            ))
            .context(format!("Invalid regex for blocked command: {}", s))
        })
        .collect()
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .context(format!("Invalid {}", name)),
        _ => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        let defaults = Config::default();

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let blocked_commands_str = std::env::var("BLOCKED_COMMANDS")
            .unwrap_or_else(|_| DEFAULT_BLOCKED_COMMANDS.to_string());
        let blocked_commands = compile_blocked_commands(&blocked_commands_str)?;

        let history_capacity = env_parse("HISTORY_CAPACITY", defaults.history_capacity)?;
        if history_capacity == 0 {
            anyhow::bail!("HISTORY_CAPACITY must be at least 1");
        }
        let max_pipeline_stages = env_parse("MAX_PIPELINE_STAGES", defaults.max_pipeline_stages)?;
        if max_pipeline_stages == 0 {
            anyhow::bail!("MAX_PIPELINE_STAGES must be at least 1");
        }

        let pipeline_timeout = env_millis("PIPELINE_TIMEOUT_MS", defaults.pipeline_timeout)?;
        let fg_timeout = env_millis("FG_TIMEOUT_MS", defaults.fg_timeout)?;
        let multiwatch_timeout = env_millis("MULTIWATCH_TIMEOUT_MS", defaults.multiwatch_timeout)?;
        let kill_grace = env_millis("KILL_GRACE_MS", defaults.kill_grace)?;
        let poll_interval = env_millis("POLL_INTERVAL_MS", defaults.poll_interval)?;
        if poll_interval.is_zero() {
            warn!("POLL_INTERVAL_MS of 0 would spin; using 1ms");
        }
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        let max_capture_bytes = env_parse("MAX_CAPTURE_BYTES", defaults.max_capture_bytes)?;

        let sink_dir = match std::env::var("SINK_DIR").ok().filter(|s| !s.is_empty()) {
            Some(dir) => expand_tilde(&dir),
            None => defaults.sink_dir,
        };
        if !sink_dir.is_dir() {
            anyhow::bail!("SINK_DIR is not a valid directory: {:?}", sink_dir);
        }

        let command_log_file = std::env::var("COMMAND_LOG_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s));
        let command_log_max_size_bytes = std::env::var("COMMAND_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(defaults.command_log_max_size_bytes);

        let display_columns = env_parse("DISPLAY_COLUMNS", defaults.display_columns)?.max(1);

        Ok(Config {
            log_level,
            blocked_commands,
            history_capacity,
            max_pipeline_stages,
            pipeline_timeout,
            fg_timeout,
            multiwatch_timeout,
            kill_grace,
            poll_interval,
            max_capture_bytes,
            sink_dir,
            command_log_file,
            command_log_max_size_bytes,
            display_columns,
        })
    }
}
