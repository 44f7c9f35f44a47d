//! `multiWatch`: run several commands side by side, each writing into its own
//! on-disk sink, and interleave their output as timestamped lines.
//!
//! Sinks are regular files so output written just before a process exits is
//! still there to read after it is reaped. Every batch ends in the same
//! teardown: survivors are terminated with escalation and reaped, read
//! handles are closed and the sink files are deleted.

use crate::config::Config;
use crate::display::Display;
use crate::engine::control::ControlRequest;
use crate::engine::executor::resolve_program;
use crate::engine::parser::{tokenize, MULTIWATCH_MAX};
use crate::engine::process::{ExitClass, LoopContext, ProcessSet};
use crate::error::AppError;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const READ_CHUNK: usize = 8192;
/// Per streaming pass, so one chatty command cannot starve the others.
const MAX_CHUNKS_PER_PASS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Completed,
    Interrupted,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedCommand {
    pub command: String,
    pub pid: Option<u32>,
    pub exit: Option<ExitClass>,
    pub lines: usize,
    pub sink_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WatchReport {
    pub status: WatchStatus,
    pub commands: Vec<WatchedCommand>,
}

impl WatchReport {
    pub fn summary(&self, timeout_ms: u128) -> String {
        match self.status {
            WatchStatus::Completed => {
                format!("multiWatch: all {} commands finished", self.commands.len())
            }
            WatchStatus::Interrupted => "multiWatch interrupted".to_string(),
            WatchStatus::TimedOut => format!("multiWatch timed out after {} ms", timeout_ms),
        }
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[derive(Debug)]
struct Watcher {
    command: String,
    sink_path: PathBuf,
    reader: Option<tokio::fs::File>,
    partial: Vec<u8>,
    pid: Option<u32>,
    active: bool,
    exit: Option<ExitClass>,
    lines: usize,
    sink_removed: bool,
}

impl Watcher {
    fn format_line(&mut self, raw: &[u8]) -> String {
        self.lines += 1;
        let text = String::from_utf8_lossy(raw);
        format!(
            "[{}] {}: {}",
            timestamp(),
            self.command,
            text.trim_end_matches('\r')
        )
    }

    /// Reads whatever the sink currently holds. Returns true if bytes arrived.
    /// A zero-length read on a file only means "nothing new yet".
    async fn read_available(&mut self, out: &mut Vec<String>) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut got_data = false;
        let mut failed = false;
        for _ in 0..MAX_CHUNKS_PER_PASS {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    got_data = true;
                    self.partial.extend_from_slice(&chunk[..n]);
                }
                Err(e) => {
                    warn!(command = %self.command, error = %e, "Sink read failed, closing it");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.reader = None;
        }
        self.take_lines(out, false);
        got_data
    }

    /// Reads the sink up to its current end. Once the writer has been reaped
    /// that end is final, so everything it wrote is in `out` afterwards.
    async fn drain_sink(&mut self, out: &mut Vec<String>) {
        while self.read_available(out).await {}
    }

    fn take_lines(&mut self, out: &mut Vec<String>, flush: bool) {
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let formatted = self.format_line(&line[..line.len() - 1]);
            out.push(formatted);
        }
        if flush && !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            let formatted = self.format_line(&rest);
            out.push(formatted);
        }
    }

    fn finished_notice(&self) -> String {
        let how = self
            .exit
            .map(|e| e.to_string())
            .unwrap_or_else(|| "status unknown".to_string());
        format!("[{}] {}: command finished ({})", timestamp(), self.command, how)
    }
}

/// Everything one invocation owns. Dropping it without `teardown` still
/// deletes the sinks; children are spawned with `kill_on_drop`.
#[derive(Debug, Default)]
struct WatchBatch {
    set: ProcessSet,
    watchers: Vec<Watcher>,
    /// Maps a `ProcessSet` index to its watcher.
    set_index: Vec<usize>,
}

impl WatchBatch {
    async fn add(&mut self, index: usize, command: &str, cwd: &Path, sink_dir: &Path) -> Result<(), AppError> {
        let sink_path = sink_path(sink_dir, index);
        let writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&sink_path)?;
        let watcher_index = self.watchers.len();
        self.watchers.push(Watcher {
            command: command.to_string(),
            sink_path: sink_path.clone(),
            reader: None,
            partial: Vec::new(),
            pid: None,
            active: false,
            exit: None,
            lines: 0,
            sink_removed: false,
        });
        let reader = tokio::fs::File::open(&sink_path).await?;

        let mut process = watch_command(command, cwd);
        process
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer.try_clone()?))
            .stderr(Stdio::from(writer))
            .kill_on_drop(true);
        let pid = self.set.spawn(command, process)?;

        let watcher = &mut self.watchers[watcher_index];
        watcher.reader = Some(reader);
        watcher.pid = Some(pid);
        watcher.active = true;
        self.set_index.push(watcher_index);
        debug!(pid, command, sink = %sink_path.display(), "Watch process started");
        Ok(())
    }

    /// Terminates survivors, reads what is left, then closes and deletes sinks.
    async fn teardown(&mut self, grace: Duration, out: &mut Vec<String>) {
        self.set.shutdown(grace).await;
        for (set_idx, &watcher_index) in self.set_index.iter().enumerate() {
            let watcher = &mut self.watchers[watcher_index];
            if watcher.active {
                watcher.drain_sink(out).await;
                watcher.take_lines(out, true);
                watcher.exit = self.set.get(set_idx).and_then(|c| c.exit_class());
                watcher.active = false;
            }
        }
        for watcher in &mut self.watchers {
            watcher.drain_sink(out).await;
            watcher.take_lines(out, true);
            watcher.reader = None;
            remove_sink(&watcher.sink_path).await;
            watcher.sink_removed = true;
        }
    }

    fn report(&self, status: WatchStatus) -> WatchReport {
        WatchReport {
            status,
            commands: self
                .watchers
                .iter()
                .map(|w| WatchedCommand {
                    command: w.command.clone(),
                    pid: w.pid,
                    exit: w.exit,
                    lines: w.lines,
                    sink_path: w.sink_path.clone(),
                })
                .collect(),
        }
    }
}

impl Drop for WatchBatch {
    fn drop(&mut self) {
        for watcher in self.watchers.iter().filter(|w| !w.sink_removed) {
            let _ = std::fs::remove_file(&watcher.sink_path);
        }
    }
}

fn sink_path(sink_dir: &Path, index: usize) -> PathBuf {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    sink_dir.join(format!(
        "tabshell-watch-{}-{}-{}.log",
        std::process::id(),
        index,
        nanos
    ))
}

async fn remove_sink(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete sink file"),
    }
}

/// Commands containing a pipe go through `sh -c`; anything else is exec'd directly.
fn watch_command(command: &str, cwd: &Path) -> TokioCommand {
    let mut process = if command.contains('|') {
        let mut sh = TokioCommand::new("sh");
        sh.arg("-c").arg(command);
        sh
    } else {
        let argv = tokenize(command);
        let mut direct = TokioCommand::new(resolve_program(&argv[0], cwd));
        direct.args(&argv[1..]);
        direct
    };
    process.current_dir(cwd);
    process
}

#[derive(Debug)]
pub struct MultiWatchSupervisor {
    config: Arc<Config>,
}

impl MultiWatchSupervisor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    #[instrument(skip(self, commands, display, ctx), fields(commands = commands.len()))]
    pub async fn run(
        &self,
        commands: &[String],
        cwd: &Path,
        display: &mut dyn Display,
        ctx: &mut LoopContext<'_>,
    ) -> Result<WatchReport, AppError> {
        if commands.is_empty() || commands.len() > MULTIWATCH_MAX {
            return Err(AppError::usage(format!(
                "multiWatch takes 1 to {} commands (got {})",
                MULTIWATCH_MAX,
                commands.len()
            )));
        }
        if let Some(blank) = commands.iter().find(|c| tokenize(c).is_empty()) {
            return Err(AppError::usage(format!("empty multiWatch command '{}'", blank)));
        }

        let mut batch = WatchBatch::default();
        let result = self.watch(&mut batch, commands, cwd, display, ctx).await;

        let mut lines = Vec::new();
        batch.teardown(ctx.kill_grace, &mut lines).await;
        if !lines.is_empty() {
            display.append_lines(&lines.join("\n"));
        }

        let status = result?;
        info!(?status, "multiWatch batch ended");
        Ok(batch.report(status))
    }

    async fn watch(
        &self,
        batch: &mut WatchBatch,
        commands: &[String],
        cwd: &Path,
        display: &mut dyn Display,
        ctx: &mut LoopContext<'_>,
    ) -> Result<WatchStatus, AppError> {
        let mut failures = Vec::new();
        for (index, command) in commands.iter().enumerate() {
            match batch.add(index, command, cwd, &self.config.sink_dir).await {
                Ok(()) => {}
                Err(e @ AppError::SpawnError { .. }) => {
                    warn!(command = %command, error = %e, "Watch command failed to start");
                    display.append_lines(&format!("[{}] {}: {}", timestamp(), command, e));
                    failures.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        if batch.set.is_empty() {
            return Err(failures
                .into_iter()
                .next()
                .unwrap_or_else(|| AppError::usage("no command specified")));
        }

        let expiry = tokio::time::sleep_until(Instant::now() + self.config.multiwatch_timeout);
        tokio::pin!(expiry);

        loop {
            let mut lines = Vec::new();
            let mut got_data = false;
            for watcher in batch.watchers.iter_mut() {
                got_data |= watcher.read_available(&mut lines).await;
            }

            for set_idx in batch.set.reap_exited() {
                let watcher = &mut batch.watchers[batch.set_index[set_idx]];
                watcher.drain_sink(&mut lines).await;
                watcher.take_lines(&mut lines, true);
                watcher.exit = batch.set.get(set_idx).and_then(|c| c.exit_class());
                watcher.active = false;
                lines.push(watcher.finished_notice());
            }

            if !lines.is_empty() {
                display.append_lines(&lines.join("\n"));
            }

            if batch.set.all_exited() {
                return Ok(WatchStatus::Completed);
            }

            let pause = if got_data {
                Duration::ZERO
            } else {
                ctx.poll_interval
            };
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => return Ok(WatchStatus::Interrupted),
                request = ctx.control.next() => match request {
                    ControlRequest::Interrupt => return Ok(WatchStatus::Interrupted),
                    ControlRequest::Stop => debug!("Stop request ignored while watching"),
                },
                _ = &mut expiry => {
                    warn!("multiWatch deadline reached");
                    return Ok(WatchStatus::TimedOut);
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
