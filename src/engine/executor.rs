//! Foreground pipeline execution: pipe-chain wiring, capture of the final
//! stage, supervision and unconditional cleanup.

use crate::config::Config;
use crate::engine::parser::{Pipeline, Stage};
use crate::engine::process::{
    supervise, Capture, ExitClass, LoopContext, LoopExit, ProcessSet, SupervisedChild,
};
use crate::error::AppError;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::unix::pipe;
use tokio::process::Command as TokioCommand;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited(ExitClass),
    /// Interrupted by request; carries how the foreground process ended.
    Interrupted(Option<ExitClass>),
    TimedOut,
    Stopped,
}

/// A process that was stopped while in the foreground, with its capture pipe,
/// ready to be parked in the job table.
#[derive(Debug)]
pub struct Suspended {
    pub process: SupervisedChild,
    pub capture: Capture,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub output: String,
    pub captured_bytes: usize,
    pub status: RunStatus,
    /// Per-stage problems that did not abort the whole run.
    pub notices: Vec<String>,
    pub spawned: usize,
    pub pids: Vec<u32>,
    pub suspended: Option<Suspended>,
}

impl RunOutcome {
    /// Lines to show for this run. Output wins; otherwise the exit classification.
    pub fn render(&self, timeout_ms: u128) -> Vec<String> {
        let mut lines = self.notices.clone();
        if self.captured_bytes > 0 {
            lines.push(self.output.trim_end_matches('\n').to_string());
        }
        match self.status {
            RunStatus::Exited(class) if self.captured_bytes == 0 => lines.push(class.message()),
            RunStatus::Interrupted(Some(class)) if self.captured_bytes == 0 => {
                lines.push(class.message())
            }
            RunStatus::Interrupted(None) if self.captured_bytes == 0 => {
                lines.push("Command interrupted".to_string())
            }
            RunStatus::TimedOut => lines.push(AppError::TimeoutError(timeout_ms).to_string()),
            _ => {}
        }
        lines
    }
}

#[derive(Debug)]
pub struct PipelineExecutor {
    config: Arc<Config>,
}

struct StageWiring {
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
}

impl PipelineExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    #[instrument(skip(self, pipeline, ctx), fields(command = %pipeline.text(), stages = pipeline.len()))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        cwd: &Path,
        ctx: &mut LoopContext<'_>,
    ) -> Result<RunOutcome, AppError> {
        let (capture_read, capture_write) = pipe2(OFlag::O_CLOEXEC)?;
        let mut capture = Capture::new(
            pipe::Receiver::from_owned_fd(capture_read)?,
            self.config.max_capture_bytes,
        );

        let mut set = ProcessSet::new();
        let mut skipped = Vec::new();
        if let Err(e) = self.spawn_stages(pipeline, cwd, capture_write, &mut set, &mut skipped) {
            set.shutdown(ctx.kill_grace).await;
            return Err(e);
        }

        let foreground_pid = match set.last() {
            Some(child) => child.pid(),
            None => {
                // Nothing could be started; every stage failed its redirection.
                return Err(skipped
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| AppError::usage("no command specified")));
            }
        };
        let notices: Vec<String> = skipped.iter().map(|e| e.to_string()).collect();
        *ctx.foreground = Some(foreground_pid);
        info!(pid = foreground_pid, spawned = set.len(), "Pipeline running");

        let deadline = Instant::now() + self.config.pipeline_timeout;
        let exit = supervise(&mut set, Some(&mut capture), foreground_pid, deadline, ctx).await;
        let spawned = set.len();
        let pids = set.pids();
        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => {
                set.shutdown(ctx.kill_grace).await;
                *ctx.foreground = None;
                return Err(e);
            }
        };

        let stopped = match exit {
            LoopExit::Stopped => {
                capture.drain();
                Some(set.detach(set.len() - 1))
            }
            _ => None,
        };
        set.shutdown(ctx.kill_grace).await;
        *ctx.foreground = None;
        if stopped.is_none() {
            // Every stage is reaped, so the pipe reaches EOF once the kernel hands over the rest.
            capture.drain_to_eof(ctx.kill_grace).await;
        }
        let captured_bytes = capture.total_bytes();
        let output = capture.take_text();

        let status = match exit {
            LoopExit::Stopped => RunStatus::Stopped,
            LoopExit::Exited => RunStatus::Exited(
                set.last()
                    .and_then(|c| c.exit_class())
                    .unwrap_or(ExitClass::Failed(-1)),
            ),
            LoopExit::Interrupted => RunStatus::Interrupted(set.last().and_then(|c| c.exit_class())),
            LoopExit::TimedOut => RunStatus::TimedOut,
        };
        let suspended = stopped.map(|process| Suspended { process, capture });
        debug!(?status, captured_bytes, "Pipeline finished");

        Ok(RunOutcome {
            output,
            captured_bytes,
            status,
            notices,
            spawned,
            pids,
            suspended,
        })
    }

    /// Spawns one process per stage. Stages whose redirection cannot be opened
    /// are skipped and collected in `skipped`; neighbours see EOF/EPIPE instead.
    fn spawn_stages(
        &self,
        pipeline: &Pipeline,
        cwd: &Path,
        capture_write: OwnedFd,
        set: &mut ProcessSet,
        skipped: &mut Vec<AppError>,
    ) -> Result<(), AppError> {
        let stages = pipeline.stages();
        let last_index = stages.len() - 1;
        let mut upstream: Option<OwnedFd> = None;

        for (index, stage) in stages.iter().enumerate() {
            let is_last = index == last_index;
            let (stage_out, next_upstream) = if is_last {
                (capture_write.try_clone()?, None)
            } else {
                let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
                (write_end, Some(read_end))
            };
            let stdin_fd = upstream.take();
            upstream = next_upstream;

            let wiring = match wire_stage(stage, index, is_last, cwd, stdin_fd, stage_out) {
                Ok(wiring) => wiring,
                Err(e @ AppError::RedirectionError { .. }) => {
                    warn!(stage = index, error = %e, "Skipping stage");
                    skipped.push(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let command = build_command(&stage.argv, cwd, wiring);
            set.spawn(&stage.argv.join(" "), command)?;
        }
        // capture_write drops here; only children hold the write end now.
        Ok(())
    }
}

fn wire_stage(
    stage: &Stage,
    index: usize,
    is_last: bool,
    cwd: &Path,
    stdin_fd: Option<OwnedFd>,
    stage_out: OwnedFd,
) -> Result<StageWiring, AppError> {
    let stdin = match (&stage.input, index) {
        (Some(path), 0) => Stdio::from(open_input(&resolve(cwd, path))?),
        (input, _) => {
            if input.is_some() {
                warn!(stage = index, "Input redirection ignored on non-first stage");
            }
            stdin_fd.map(Stdio::from).unwrap_or_else(Stdio::null)
        }
    };

    let stderr = Stdio::from(stage_out.try_clone()?);
    let stdout = match (&stage.output, is_last) {
        (Some(path), true) => Stdio::from(open_output(&resolve(cwd, path))?),
        (output, _) => {
            if output.is_some() {
                warn!(stage = index, "Output redirection ignored on non-last stage");
            }
            Stdio::from(stage_out)
        }
    };

    Ok(StageWiring {
        stdin,
        stdout,
        stderr,
    })
}

fn build_command(argv: &[String], cwd: &Path, wiring: StageWiring) -> TokioCommand {
    let program = resolve_program(&argv[0], cwd);
    let mut command = TokioCommand::new(program);
    command
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(wiring.stdin)
        .stdout(wiring.stdout)
        .stderr(wiring.stderr);
    command
}

/// Looks the program up against the session's directory so relative paths
/// like `./run.sh` mean the same thing in every tab.
pub fn resolve_program(program: &str, cwd: &Path) -> PathBuf {
    which::which_in(program, std::env::var_os("PATH"), cwd)
        .unwrap_or_else(|_| PathBuf::from(program))
}

fn resolve(cwd: &Path, path: &Path) -> PathBuf {
    cwd.join(path)
}

fn open_input(path: &Path) -> Result<File, AppError> {
    File::open(path).map_err(|e| AppError::RedirectionError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn open_output(path: &Path) -> Result<File, AppError> {
    File::create(path).map_err(|e| AppError::RedirectionError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
