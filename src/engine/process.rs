//! Spawn-and-supervise primitive shared by the pipeline executor, `fg` and
//! multiWatch. Callers decide how stdio is wired; this module owns signal
//! delivery, non-blocking reaping, the supervision loop and kill escalation.

use crate::engine::control::{ControlListener, ControlRequest};
use crate::error::AppError;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const READ_CHUNK: usize = 8192;

pub fn send_signal(pid: u32, sig: Signal) -> Result<(), AppError> {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitClass {
    Success,
    Failed(i32),
    Signaled(i32),
}

impl ExitClass {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitClass::Success,
            (Some(code), _) => ExitClass::Failed(code),
            (None, Some(sig)) => ExitClass::Signaled(sig),
            (None, None) => ExitClass::Failed(-1),
        }
    }

    pub fn message(&self) -> String {
        match self {
            ExitClass::Success => "(no output)".to_string(),
            ExitClass::Failed(code) => format!("Command failed with exit code {}", code),
            ExitClass::Signaled(sig) => format!("Command terminated by signal {}", sig),
        }
    }
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClass::Success => write!(f, "exit code 0"),
            ExitClass::Failed(code) => write!(f, "exit code {}", code),
            ExitClass::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

#[derive(Debug)]
pub struct SupervisedChild {
    pid: u32,
    label: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl SupervisedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_class(&self) -> Option<ExitClass> {
        self.status.map(ExitClass::from_status)
    }

    /// Non-blocking completion check. Once reaped the status is remembered.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>, AppError> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
            if let Some(status) = self.status {
                debug!(pid = self.pid, command = %self.label, ?status, "Child reaped");
            }
        }
        Ok(self.status)
    }

    pub fn signal(&self, sig: Signal) -> Result<(), AppError> {
        if self.status.is_some() {
            return Ok(());
        }
        send_signal(self.pid, sig)
    }

    /// SIGTERM, wait `grace`, then SIGKILL. Always ends with the child reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.try_reap() {
            return Some(status);
        }
        self.request_termination();
        self.finish_termination(Instant::now() + grace).await
    }

    fn request_termination(&self) {
        let _ = self.signal(Signal::SIGTERM);
        // A stopped process only acts on SIGTERM once continued.
        let _ = self.signal(Signal::SIGCONT);
    }

    async fn finish_termination(&mut self, deadline: Instant) -> Option<ExitStatus> {
        if self.status.is_some() {
            return self.status;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, self.child.wait()).await {
            Ok(Ok(status)) => self.status = Some(status),
            Ok(Err(e)) => warn!(pid = self.pid, error = %e, "Failed to wait for child"),
            Err(_) => {
                warn!(pid = self.pid, command = %self.label, "Child survived SIGTERM, sending SIGKILL");
                if let Err(e) = self.child.start_kill() {
                    warn!(pid = self.pid, error = %e, "Failed to send SIGKILL");
                }
                match self.child.wait().await {
                    Ok(status) => self.status = Some(status),
                    Err(e) => warn!(pid = self.pid, error = %e, "Failed to reap killed child"),
                }
            }
        }
        self.status
    }
}

/// The children of one blocking operation.
#[derive(Debug, Default)]
pub struct ProcessSet {
    children: Vec<SupervisedChild>,
}

impl ProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_child(child: SupervisedChild) -> Self {
        Self {
            children: vec![child],
        }
    }

    /// Spawns into its own process group so terminal-generated signals only
    /// reach it through the session.
    #[instrument(skip(self, label, command), fields(command = %label))]
    pub fn spawn(&mut self, label: &str, mut command: TokioCommand) -> Result<u32, AppError> {
        command.process_group(0);
        let child = command.spawn().map_err(|e| AppError::spawn(label, &e))?;
        let pid = child.id().ok_or_else(|| AppError::SpawnError {
            command: label.to_string(),
            reason: "process exited before its id could be read".to_string(),
        })?;
        debug!(pid, "Spawned child");
        self.children.push(SupervisedChild {
            pid,
            label: label.to_string(),
            child,
            status: None,
        });
        Ok(pid)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SupervisedChild> {
        self.children.get(index)
    }

    pub fn last(&self) -> Option<&SupervisedChild> {
        self.children.last()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(|c| c.pid).collect()
    }

    /// Reaps whatever has exited and returns the indices that just completed.
    pub fn reap_exited(&mut self) -> Vec<usize> {
        let mut newly = Vec::new();
        for (index, child) in self.children.iter_mut().enumerate() {
            if child.status.is_some() {
                continue;
            }
            match child.try_reap() {
                Ok(Some(_)) => newly.push(index),
                Ok(None) => {}
                Err(e) => warn!(pid = child.pid, error = %e, "Non-blocking wait failed"),
            }
        }
        newly
    }

    pub fn all_exited(&self) -> bool {
        self.children.iter().all(|c| c.status.is_some())
    }

    pub fn detach(&mut self, index: usize) -> SupervisedChild {
        self.children.remove(index)
    }

    /// Terminates every live child with escalation and reaps all of them.
    #[instrument(skip(self), fields(children = self.children.len()))]
    pub async fn shutdown(&mut self, grace: Duration) {
        self.reap_exited();
        let alive: Vec<usize> = (0..self.children.len())
            .filter(|&i| self.children[i].status.is_none())
            .collect();
        if alive.is_empty() {
            return;
        }
        debug!(alive = alive.len(), "Terminating live children");
        for &i in &alive {
            self.children[i].request_termination();
        }
        let deadline = Instant::now() + grace;
        for &i in &alive {
            self.children[i].finish_termination(deadline).await;
        }
    }
}

/// Accumulates captured bytes, keeping roughly the last `max_bytes`.
#[derive(Debug)]
pub struct CaptureBuffer {
    bytes: Vec<u8>,
    max_bytes: usize,
    total: usize,
}

impl CaptureBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_bytes: max_bytes.max(1),
            total: 0,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.total += data.len();
        self.bytes.extend_from_slice(data);

        // Let the buffer grow to twice the limit before cutting back to the tail.
        if self.bytes.len() > self.max_bytes * 2 {
            let keep_from = self.bytes.len() - self.max_bytes;
            // Skip UTF-8 continuation bytes (0b10xxxxxx) so a character is never split.
            let safe_keep_from = (keep_from..self.bytes.len())
                .find(|&i| (self.bytes[i] as i8) >= -64)
                .unwrap_or(self.bytes.len());
            self.bytes.drain(0..safe_keep_from);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Returns the retained text and resets the buffer.
    pub fn take_text(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.bytes).to_string();
        self.bytes.clear();
        self.total = 0;
        text
    }
}

/// Read end of a capture pipe plus what has been read from it so far.
#[derive(Debug)]
pub struct Capture {
    rx: Option<pipe::Receiver>,
    buffer: CaptureBuffer,
}

impl Capture {
    pub fn new(rx: pipe::Receiver, max_bytes: usize) -> Self {
        Self {
            rx: Some(rx),
            buffer: CaptureBuffer::new(max_bytes),
        }
    }

    /// A capture with nothing left to read.
    pub fn closed(max_bytes: usize) -> Self {
        Self {
            rx: None,
            buffer: CaptureBuffer::new(max_bytes),
        }
    }

    pub fn is_open(&self) -> bool {
        self.rx.is_some()
    }

    pub fn total_bytes(&self) -> usize {
        self.buffer.total_bytes()
    }

    pub fn take_text(&mut self) -> String {
        self.buffer.take_text()
    }

    async fn read_chunk(&mut self, chunk: &mut [u8]) -> std::io::Result<usize> {
        match self.rx.as_mut() {
            Some(rx) => rx.read(chunk).await,
            None => std::future::pending().await,
        }
    }

    fn accept(&mut self, result: std::io::Result<usize>, chunk: &[u8]) {
        match result {
            Ok(0) => self.rx = None,
            Ok(n) => self.buffer.append(&chunk[..n]),
            Err(e) => {
                warn!(error = %e, "Capture read failed, closing capture");
                self.rx = None;
            }
        }
    }

    /// Reads until every writer has closed the pipe, or until `limit` passes
    /// (a grandchild may still hold the write end).
    pub async fn drain_to_eof(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; READ_CHUNK];
        while self.is_open() {
            match tokio::time::timeout_at(deadline, self.read_chunk(&mut chunk)).await {
                Ok(result) => self.accept(result, &chunk),
                Err(_) => {
                    debug!(captured = self.total_bytes(), "Capture still open after exit, giving up on EOF");
                    self.drain();
                    break;
                }
            }
        }
    }

    /// Hands the pipe to a task that keeps reading it, so a job running
    /// without a reader never blocks on a full pipe.
    pub fn pump_in_background(self) -> BackgroundCapture {
        let stop = CancellationToken::new();
        let task = tokio::spawn(pump(self, stop.clone()));
        BackgroundCapture { stop, task }
    }

    /// Reads whatever is immediately available without waiting.
    pub fn drain(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        while let Some(rx) = self.rx.as_ref() {
            match rx.try_read(&mut chunk) {
                Ok(0) => self.rx = None,
                Ok(n) => self.buffer.append(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Capture drain failed, closing capture");
                    self.rx = None;
                }
            }
        }
    }
}

async fn pump(mut capture: Capture, stop: CancellationToken) -> Capture {
    let mut chunk = [0u8; READ_CHUNK];
    while capture.is_open() {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = capture.read_chunk(&mut chunk) => capture.accept(result, &chunk),
        }
    }
    capture
}

/// A capture being read by its own task.
#[derive(Debug)]
pub struct BackgroundCapture {
    stop: CancellationToken,
    task: JoinHandle<Capture>,
}

impl BackgroundCapture {
    /// Stops the reading task and takes the capture back with everything it read.
    pub async fn reclaim(self) -> Option<Capture> {
        self.stop.cancel();
        match self.task.await {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!(error = %e, "Capture task failed, its output is lost");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Every child in the set has exited.
    Exited,
    /// Interrupt request or session shutdown; SIGINT went to the foreground pid.
    Interrupted,
    /// Stop request; SIGSTOP went to the foreground pid.
    Stopped,
    TimedOut,
}

/// Per-operation view of the session state a supervision loop needs.
pub struct LoopContext<'a> {
    pub control: &'a mut ControlListener,
    pub shutdown: &'a CancellationToken,
    pub foreground: &'a mut Option<u32>,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
}

/// Waits for the set to finish while streaming `capture`, reacting to
/// interrupt/stop requests and the deadline.
#[instrument(skip(set, capture, ctx), fields(children = set.len()))]
pub async fn supervise(
    set: &mut ProcessSet,
    mut capture: Option<&mut Capture>,
    foreground_pid: u32,
    deadline: Instant,
    ctx: &mut LoopContext<'_>,
) -> Result<LoopExit, AppError> {
    let mut tick = tokio::time::interval(ctx.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let capture_open = capture.as_ref().is_some_and(|c| c.is_open());
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                debug!(pid = foreground_pid, "Session shutting down, interrupting foreground");
                send_signal(foreground_pid, Signal::SIGINT)?;
                return Ok(LoopExit::Interrupted);
            }
            request = ctx.control.next() => {
                match request {
                    ControlRequest::Interrupt => {
                        debug!(pid = foreground_pid, "Interrupting foreground process");
                        send_signal(foreground_pid, Signal::SIGINT)?;
                        return Ok(LoopExit::Interrupted);
                    }
                    ControlRequest::Stop => {
                        debug!(pid = foreground_pid, "Stopping foreground process");
                        send_signal(foreground_pid, Signal::SIGSTOP)?;
                        return Ok(LoopExit::Stopped);
                    }
                }
            }
            result = read_capture(&mut capture, &mut chunk), if capture_open => {
                if let Some(c) = capture.as_deref_mut() {
                    c.accept(result, &chunk);
                }
            }
            _ = tick.tick() => {
                set.reap_exited();
                if set.all_exited() {
                    return Ok(LoopExit::Exited);
                }
            }
            _ = &mut expiry => {
                warn!(pid = foreground_pid, "Supervision deadline reached");
                return Ok(LoopExit::TimedOut);
            }
        }
    }
}

async fn read_capture(
    capture: &mut Option<&mut Capture>,
    chunk: &mut [u8],
) -> std::io::Result<usize> {
    match capture.as_deref_mut() {
        Some(c) => c.read_chunk(chunk).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::control::ControlHandle;

    fn sleeper(secs: &str) -> TokioCommand {
        let mut cmd = TokioCommand::new("sleep");
        cmd.arg(secs);
        cmd
    }

    fn is_gone(pid: u32) -> bool {
        matches!(
            signal::kill(Pid::from_raw(pid as i32), None),
            Err(Errno::ESRCH)
        )
    }

    #[test]
    fn exit_class_messages() {
        assert_eq!(ExitClass::Failed(2).message(), "Command failed with exit code 2");
        assert_eq!(ExitClass::Signaled(9).message(), "Command terminated by signal 9");
        assert_eq!(ExitClass::Success.to_string(), "exit code 0");
    }

    #[test]
    fn capture_buffer_keeps_tail_on_char_boundary() {
        let mut buffer = CaptureBuffer::new(4);
        buffer.append("ab".as_bytes());
        buffer.append("cdéfgh".as_bytes());
        assert_eq!(buffer.total_bytes(), 9);
        let text = buffer.take_text();
        assert!(text.ends_with("fgh"));
        assert!(!text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn shutdown_escalates_and_reaps_everything() {
        let mut set = ProcessSet::new();
        set.spawn("sleep 30", sleeper("30")).unwrap();
        set.spawn("sleep 30", sleeper("30")).unwrap();
        let pids = set.pids();
        set.shutdown(Duration::from_millis(200)).await;
        assert!(set.all_exited());
        for pid in pids {
            assert!(is_gone(pid), "pid {} still present", pid);
        }
    }

    #[tokio::test]
    async fn supervise_reports_interrupt() {
        let handle = ControlHandle::new();
        let mut listener = handle.listen();
        let shutdown = CancellationToken::new();
        let mut foreground = None;
        let mut set = ProcessSet::new();
        let pid = set.spawn("sleep 30", sleeper("30")).unwrap();

        let requester = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            requester.interrupt();
        });

        let mut ctx = LoopContext {
            control: &mut listener,
            shutdown: &shutdown,
            foreground: &mut foreground,
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_millis(200),
        };
        let exit = supervise(
            &mut set,
            None,
            pid,
            Instant::now() + Duration::from_secs(10),
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(exit, LoopExit::Interrupted);
        set.shutdown(Duration::from_millis(200)).await;
        assert_eq!(
            set.get(0).and_then(|c| c.exit_class()),
            Some(ExitClass::Signaled(2))
        );
    }
}
