use crate::config::Config;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

#[derive(Debug, Serialize)]
struct CommandLogEntry<'a> {
    timestamp: String,
    session: &'a str,
    command: &'a str,
}

/// Append-only JSON-lines record of submitted commands.
#[derive(Debug, Clone)]
pub struct CommandLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl CommandLogger {
    /// `None` when no `COMMAND_LOG_FILE` is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let log_file_path = config.command_log_file.clone()?;
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create command log directory");
                }
            }
        }
        Some(Self {
            log_file_path,
            max_size_bytes: config.command_log_max_size_bytes,
        })
    }

    /// Moves the current file aside when `incoming` more bytes would push it
    /// past the size limit. An empty or missing file is never rotated.
    async fn rotate_for(&self, incoming: u64) -> Result<()> {
        let size = match fs::metadata(&self.log_file_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size == 0 || size + incoming <= self.max_size_bytes {
            return Ok(());
        }
        let rotated = rotated_path(&self.log_file_path, Utc::now());
        debug!(size, rotated = %rotated.display(), "Rotating command log");
        fs::rename(&self.log_file_path, &rotated).await?;
        Ok(())
    }

    pub async fn log_command(&self, session: &str, command: &str) {
        if let Err(e) = self.try_log_command(session, command).await {
            error!(session = %session, error = %e, "Failed to write command log");
        }
    }

    async fn try_log_command(&self, session: &str, command: &str) -> Result<()> {
        let entry = CommandLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session,
            command,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.rotate_for(line.len() as u64).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// `commands.log` becomes `commands.20240131T120000.123Z.log`.
fn rotated_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let stamp = at.format("%Y%m%dT%H%M%S%.3fZ");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "commands".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}.{}", stem, stamp),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn logger(dir: &TempDir, max_size_bytes: u64) -> CommandLogger {
        let config = Config {
            command_log_file: Some(dir.path().join("commands.log")),
            command_log_max_size_bytes: max_size_bytes,
            ..Config::default()
        };
        CommandLogger::from_config(&config).unwrap()
    }

    #[test]
    fn disabled_without_a_path() {
        assert!(CommandLogger::from_config(&Config::default()).is_none());
    }

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir, 1024 * 1024);
        log.log_command("s1", "ls | wc -l").await;
        log.log_command("s1", "pwd").await;

        let contents = std::fs::read_to_string(dir.path().join("commands.log")).unwrap();
        let entries: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["command"], "ls | wc -l");
        assert_eq!(entries[1]["session"], "s1");
    }

    #[tokio::test]
    async fn rotates_once_the_size_limit_is_reached() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir, 10);
        log.log_command("s1", "a command long enough to pass the limit").await;
        log.log_command("s1", "next").await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
        let current = std::fs::read_to_string(dir.path().join("commands.log")).unwrap();
        assert!(current.contains("\"next\""));
        assert_eq!(current.lines().count(), 1);
    }

    #[test]
    fn rotated_name_keeps_stem_and_extension() {
        let at = DateTime::parse_from_rfc3339("2024-01-31T12:00:00.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            rotated_path(Path::new("/tmp/logs/commands.log"), at),
            PathBuf::from("/tmp/logs/commands.20240131T120000.123Z.log")
        );
        assert_eq!(
            rotated_path(Path::new("/tmp/history"), at),
            PathBuf::from("/tmp/history.20240131T120000.123Z")
        );
    }
}
