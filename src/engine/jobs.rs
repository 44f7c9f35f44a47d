//! Job table and job control (`jobs`, `fg`, `bg`).
//!
//! A job is created only when a foreground process is stopped. Ids grow
//! monotonically for the life of the session and are never reused.

use crate::config::Config;
use crate::engine::executor::{RunOutcome, RunStatus, Suspended};
use crate::engine::process::{
    supervise, BackgroundCapture, Capture, ExitClass, LoopContext, LoopExit, ProcessSet,
    SupervisedChild,
};
use crate::error::AppError;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Running,
    Stopped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Where a job's combined output goes while nobody is waiting on it.
#[derive(Debug)]
enum JobOutput {
    /// Stopped: the pipe is left alone until the job runs again.
    Held(Capture),
    /// Running in the background: a task keeps the pipe from filling up.
    Pumped(BackgroundCapture),
}

impl JobOutput {
    async fn into_capture(self, max_bytes: usize) -> Capture {
        match self {
            JobOutput::Held(capture) => capture,
            JobOutput::Pumped(pumped) => pumped
                .reclaim()
                .await
                .unwrap_or_else(|| Capture::closed(max_bytes)),
        }
    }
}

#[derive(Debug)]
pub struct Job {
    id: JobId,
    status: JobStatus,
    command: String,
    process: SupervisedChild,
    output: JobOutput,
}

impl Job {
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub pid: u32,
    pub status: JobStatus,
    pub command: String,
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.status, self.command)
    }
}

/// A job that left the table because its process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedJob {
    pub id: JobId,
    pub command: String,
    pub exit: Option<ExitClass>,
}

#[derive(Debug)]
pub struct JobTable {
    next_id: u64,
    jobs: Vec<Job>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            jobs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Records a process the session just stopped.
    pub fn park_stopped(&mut self, suspended: Suspended, command: &str) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        info!(job_id = id.0, pid = suspended.process.pid(), command, "Job stopped");
        self.jobs.push(Job {
            id,
            status: JobStatus::Stopped,
            command: command.to_string(),
            process: suspended.process,
            output: JobOutput::Held(suspended.capture),
        });
        id
    }

    /// Non-blocking reap of every job; exited ones are removed and returned.
    pub fn reap(&mut self) -> Vec<FinishedJob> {
        let mut finished = Vec::new();
        self.jobs.retain_mut(|job| match job.process.try_reap() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(job_id = job.id.0, ?status, "Job finished");
                finished.push(FinishedJob {
                    id: job.id,
                    command: job.command.clone(),
                    exit: Some(ExitClass::from_status(status)),
                });
                false
            }
            Err(e) => {
                warn!(job_id = job.id.0, error = %e, "Job wait failed, dropping it");
                finished.push(FinishedJob {
                    id: job.id,
                    command: job.command.clone(),
                    exit: None,
                });
                false
            }
        });
        finished
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.jobs
            .iter()
            .map(|job| JobSummary {
                id: job.id,
                pid: job.pid(),
                status: job.status,
                command: job.command.clone(),
            })
            .collect()
    }

    fn live_ids(&self) -> String {
        if self.jobs.is_empty() {
            return "none".to_string();
        }
        self.jobs
            .iter()
            .map(|j| j.id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// No id means the most recently allocated job still in the table.
    pub fn resolve(&self, requested: Option<u64>) -> Result<JobId, AppError> {
        match requested {
            None => self.jobs.iter().map(|j| j.id).max().ok_or(AppError::NoJobs),
            Some(raw) => self
                .jobs
                .iter()
                .find(|j| j.id.0 == raw)
                .map(|j| j.id)
                .ok_or_else(|| AppError::JobNotFound {
                    id: raw,
                    valid: self.live_ids(),
                }),
        }
    }

    fn take(&mut self, id: JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(index))
    }

    fn reinsert(&mut self, job: Job) {
        let index = self.jobs.partition_point(|j| j.id < job.id);
        self.jobs.insert(index, job);
    }

    /// Terminates and reaps every job. Used when the owning session closes.
    #[instrument(skip(self), fields(jobs = self.jobs.len()))]
    pub async fn terminate_all(&mut self, grace: Duration) {
        for mut job in self.jobs.drain(..) {
            let status = job.process.terminate(grace).await;
            if let JobOutput::Pumped(pumped) = job.output {
                pumped.reclaim().await;
            }
            debug!(job_id = job.id.0, ?status, "Job terminated");
        }
    }
}

/// Result of `fg`: the run outcome plus the job it concerned.
#[derive(Debug)]
pub struct ForegroundOutcome {
    pub id: JobId,
    pub command: String,
    pub run: RunOutcome,
}

#[derive(Debug)]
pub struct JobControl {
    config: Arc<Config>,
}

impl JobControl {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Resumes a job in the foreground and supervises it until it exits,
    /// is stopped again, is interrupted or times out.
    #[instrument(skip(self, table, ctx))]
    pub async fn foreground(
        &self,
        table: &mut JobTable,
        requested: Option<u64>,
        ctx: &mut LoopContext<'_>,
    ) -> Result<ForegroundOutcome, AppError> {
        table.reap();
        let id = table.resolve(requested)?;
        let Some(mut job) = table.take(id) else {
            return Err(AppError::NoJobs);
        };

        if job.status == JobStatus::Stopped {
            if let Err(e) = job.process.signal(Signal::SIGCONT) {
                table.reinsert(job);
                return Err(e);
            }
            job.status = JobStatus::Running;
        }
        let pid = job.pid();
        *ctx.foreground = Some(pid);
        info!(job_id = id.0, pid, command = %job.command, "Job resumed in foreground");

        let Job {
            id,
            command,
            process,
            output,
            ..
        } = job;
        let mut capture = output.into_capture(self.config.max_capture_bytes).await;
        let mut set = ProcessSet::from_child(process);
        let deadline = Instant::now() + self.config.fg_timeout;
        let exit = supervise(&mut set, Some(&mut capture), pid, deadline, ctx).await;
        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => {
                set.shutdown(ctx.kill_grace).await;
                *ctx.foreground = None;
                return Err(e);
            }
        };

        if exit == LoopExit::Stopped {
            capture.drain();
        } else {
            set.shutdown(ctx.kill_grace).await;
            capture.drain_to_eof(ctx.kill_grace).await;
        }
        *ctx.foreground = None;
        let captured_bytes = capture.total_bytes();
        let output = capture.take_text();

        let status = match exit {
            LoopExit::Stopped => {
                table.reinsert(Job {
                    id,
                    status: JobStatus::Stopped,
                    command: command.clone(),
                    process: set.detach(0),
                    output: JobOutput::Held(capture),
                });
                RunStatus::Stopped
            }
            LoopExit::Exited => RunStatus::Exited(
                set.last()
                    .and_then(|c| c.exit_class())
                    .unwrap_or(ExitClass::Failed(-1)),
            ),
            LoopExit::Interrupted => RunStatus::Interrupted(set.last().and_then(|c| c.exit_class())),
            LoopExit::TimedOut => RunStatus::TimedOut,
        };

        Ok(ForegroundOutcome {
            id,
            command,
            run: RunOutcome {
                output,
                captured_bytes,
                status,
                notices: Vec::new(),
                spawned: 0,
                pids: vec![pid],
                suspended: None,
            },
        })
    }

    /// Continues a stopped job without waiting for it.
    #[instrument(skip(self, table))]
    pub fn background(
        &self,
        table: &mut JobTable,
        requested: Option<u64>,
    ) -> Result<JobSummary, AppError> {
        table.reap();
        let id = table.resolve(requested)?;
        let Some(mut job) = table.take(id) else {
            return Err(AppError::NoJobs);
        };
        if job.status == JobStatus::Stopped {
            if let Err(e) = job.process.signal(Signal::SIGCONT) {
                table.reinsert(job);
                return Err(e);
            }
            job.status = JobStatus::Running;
            job.output = match job.output {
                JobOutput::Held(capture) => JobOutput::Pumped(capture.pump_in_background()),
                pumped => pumped,
            };
            info!(job_id = id.0, pid = job.pid(), "Job continued in background");
        }
        let summary = JobSummary {
            id: job.id,
            pid: job.pid(),
            status: job.status,
            command: job.command.clone(),
        };
        table.reinsert(job);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::control::ControlHandle;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::process::Stdio;
    use tokio::net::unix::pipe;
    use tokio::process::Command as TokioCommand;
    use tokio_util::sync::CancellationToken;

    fn suspended_sleep(secs: &str) -> Suspended {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut command = TokioCommand::new("sleep");
        command
            .arg(secs)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end.try_clone().unwrap()))
            .stderr(Stdio::from(write_end));
        let mut set = ProcessSet::new();
        set.spawn("sleep", command).unwrap();
        let process = set.detach(0);
        process.signal(Signal::SIGSTOP).unwrap();
        Suspended {
            process,
            capture: Capture::new(pipe::Receiver::from_owned_fd(read_end).unwrap(), 4096),
        }
    }

    fn control(fg_timeout_ms: u64) -> JobControl {
        JobControl::new(Arc::new(Config {
            fg_timeout: Duration::from_millis(fg_timeout_ms),
            ..Config::default()
        }))
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_never_reused() {
        let mut table = JobTable::new();
        let first = table.park_stopped(suspended_sleep("30"), "sleep 30");
        let second = table.park_stopped(suspended_sleep("30"), "sleep 30");
        assert_eq!((first, second), (JobId(1), JobId(2)));

        table.terminate_all(Duration::from_millis(200)).await;
        assert!(table.is_empty());
        let third = table.park_stopped(suspended_sleep("30"), "sleep 30");
        assert_eq!(third, JobId(3));
        table.terminate_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn unknown_id_lists_the_live_ids() {
        let mut table = JobTable::new();
        assert!(matches!(table.resolve(None), Err(AppError::NoJobs)));
        table.park_stopped(suspended_sleep("30"), "a");
        table.park_stopped(suspended_sleep("30"), "b");
        table.park_stopped(suspended_sleep("30"), "c");
        let middle = table.jobs.iter_mut().find(|j| j.id == JobId(2)).unwrap();
        middle.process.terminate(Duration::from_millis(200)).await;
        table.reap();

        assert_eq!(table.resolve(None).unwrap(), JobId(3));
        match table.resolve(Some(2)) {
            Err(AppError::JobNotFound { id, valid }) => {
                assert_eq!(id, 2);
                assert_eq!(valid, "1, 3");
            }
            other => panic!("unexpected {:?}", other),
        }
        table.terminate_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn exited_jobs_are_reaped_from_the_table() {
        let mut table = JobTable::new();
        let id = table.park_stopped(suspended_sleep("30"), "sleep 30");
        let job = table.jobs.iter_mut().find(|j| j.id == id).unwrap();
        job.process.terminate(Duration::from_millis(200)).await;

        let finished = table.reap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, id);
        assert!(table.is_empty());
        assert!(table.summaries().is_empty());
    }

    #[tokio::test]
    async fn fg_runs_a_stopped_job_to_completion() {
        let mut table = JobTable::new();
        table.park_stopped(suspended_sleep("0.3"), "sleep 0.3");
        let handle = ControlHandle::new();
        let mut listener = handle.listen();
        let shutdown = CancellationToken::new();
        let mut foreground = None;
        let mut ctx = LoopContext {
            control: &mut listener,
            shutdown: &shutdown,
            foreground: &mut foreground,
            poll_interval: Duration::from_millis(10),
            kill_grace: Duration::from_millis(200),
        };

        let outcome = control(5000).foreground(&mut table, None, &mut ctx).await.unwrap();
        assert_eq!(outcome.id, JobId(1));
        assert_eq!(outcome.run.status, RunStatus::Exited(ExitClass::Success));
        assert!(table.is_empty());
        assert!(foreground.is_none());
    }

    #[tokio::test]
    async fn bg_job_writing_more_than_a_pipe_buffer_runs_to_completion() {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut command = TokioCommand::new("head");
        command
            .args(["-c", "300000", "/dev/zero"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end.try_clone().unwrap()))
            .stderr(Stdio::from(write_end));
        let mut set = ProcessSet::new();
        set.spawn("head", command).unwrap();
        let process = set.detach(0);
        process.signal(Signal::SIGSTOP).unwrap();
        let suspended = Suspended {
            process,
            capture: Capture::new(pipe::Receiver::from_owned_fd(read_end).unwrap(), 4096),
        };

        let mut table = JobTable::new();
        table.park_stopped(suspended, "head -c 300000 /dev/zero");
        control(5000).background(&mut table, None).unwrap();

        let mut finished = Vec::new();
        for _ in 0..500 {
            finished = table.reap();
            if !finished.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(finished.len(), 1, "background job blocked on its output");
        assert_eq!(finished[0].exit, Some(ExitClass::Success));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn bg_continues_without_waiting() {
        let mut table = JobTable::new();
        table.park_stopped(suspended_sleep("30"), "sleep 30");
        let summary = control(5000).background(&mut table, Some(1)).unwrap();
        assert_eq!(summary.status, JobStatus::Running);
        assert_eq!(summary.to_string(), "[1] Running sleep 30");
        assert_eq!(table.summaries()[0].status, JobStatus::Running);
        table.terminate_all(Duration::from_millis(200)).await;
    }
}
