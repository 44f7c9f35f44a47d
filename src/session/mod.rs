//! One tab's shell state: working directory, history, job table, the
//! foreground process and the line editor. A session is driven by exactly
//! one task; nothing in it is shared with other sessions.

pub mod editor;

use crate::config::Config;
use crate::display::Display;
use crate::engine::completion::complete;
use crate::engine::control::ControlHandle;
use crate::engine::executor::{PipelineExecutor, RunStatus};
use crate::engine::history::History;
use crate::engine::jobs::{JobControl, JobTable};
use crate::engine::multiwatch::MultiWatchSupervisor;
use crate::engine::parser::{parse_line, Builtin, ParsedLine, Pipeline};
use crate::engine::process::LoopContext;
use crate::engine::safety::SafetyFilter;
use crate::error::AppError;
use crate::utils::command_log::CommandLogger;
use crate::utils::path_utils::resolve_directory;
use editor::{InputEvent, LineEditor, Shortcut};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub struct Session {
    id: String,
    config: Arc<Config>,
    cwd: PathBuf,
    history: History,
    jobs: JobTable,
    foreground: Option<u32>,
    display: Box<dyn Display>,
    editor: LineEditor,
    control: ControlHandle,
    shutdown: CancellationToken,
    filter: SafetyFilter,
    executor: PipelineExecutor,
    job_control: JobControl,
    multiwatch: MultiWatchSupervisor,
    command_log: Option<CommandLogger>,
}

impl Session {
    pub fn new(config: Arc<Config>, cwd: PathBuf, display: Box<dyn Display>) -> Self {
        let id = Uuid::new_v4().to_string();
        info!(session_id = %id, cwd = %cwd.display(), "Session created");
        let mut session = Self {
            id,
            cwd,
            history: History::new(config.history_capacity),
            jobs: JobTable::new(),
            foreground: None,
            display,
            editor: LineEditor::new(),
            control: ControlHandle::new(),
            shutdown: CancellationToken::new(),
            filter: SafetyFilter::from_config(&config),
            executor: PipelineExecutor::new(config.clone()),
            job_control: JobControl::new(config.clone()),
            multiwatch: MultiWatchSupervisor::new(config.clone()),
            command_log: CommandLogger::from_config(&config),
            config,
        };
        session.refresh_prompt();
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle for interrupt/stop requests; usable while the session is busy.
    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Cancelled when the session is closing.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn show(&mut self, text: &str) {
        self.display.append_lines(text);
    }

    fn show_all(&mut self, lines: &[String]) {
        if !lines.is_empty() {
            self.display.append_lines(&lines.join("\n"));
        }
    }

    fn refresh_prompt(&mut self) {
        let (prompt, cursor) = self.editor.prompt();
        self.display.show_prompt(&prompt, cursor);
    }

    pub async fn handle_input(&mut self, event: InputEvent) {
        let searching = self.editor.in_search();
        match event {
            InputEvent::Char(c) if searching => self.editor.search_insert(c, &self.history),
            InputEvent::Char(c) => self.editor.insert(c),
            InputEvent::Insert(text) => {
                for c in text.chars() {
                    if searching {
                        self.editor.search_insert(c, &self.history);
                    } else {
                        self.editor.insert(c);
                    }
                }
            }
            InputEvent::Backspace if searching => self.editor.search_backspace(&self.history),
            InputEvent::Backspace => self.editor.backspace(),
            InputEvent::CursorLeft => self.editor.move_left(),
            InputEvent::CursorRight => self.editor.move_right(),
            InputEvent::Complete if searching => self.list_search_candidates(),
            InputEvent::Complete => self.complete_token().await,
            InputEvent::Submit if searching => self.editor.accept_search(),
            InputEvent::Submit => {
                let line = self.editor.take_line();
                self.submit_line(&line).await;
            }
            InputEvent::Cancel if searching => self.editor.cancel_search(),
            InputEvent::Cancel => self.editor.clear(),
            InputEvent::Shortcut(Shortcut::EnterSearch) => self.editor.enter_search(),
            InputEvent::Shortcut(Shortcut::InterruptForeground) => self.control.interrupt(),
            InputEvent::Shortcut(Shortcut::StopForeground) => self.control.stop(),
            InputEvent::Shortcut(other) => {
                debug!(session_id = %self.id, shortcut = ?other, "Tab shortcut ignored by session");
            }
        }
        self.refresh_prompt();
    }

    fn list_search_candidates(&mut self) {
        let query = self.editor.search_query().unwrap_or_default().to_string();
        let lines: Vec<String> = self
            .history
            .candidates(&query)
            .into_iter()
            .map(|m| format!("{:>5}  {}", m.index + 1, m.entry))
            .collect();
        self.show_all(&lines);
    }

    async fn complete_token(&mut self) {
        let line = self.editor.line();
        match complete(&line, self.editor.cursor(), &self.cwd, self.config.display_columns).await {
            Ok(completion) => {
                self.editor.set_line(&completion.line, completion.cursor);
                self.show_all(&completion.listing);
            }
            Err(e) => self.show(&format!("Error: {}", e)),
        }
    }

    /// Runs one line. Errors are shown on the display; none of them end the session.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn submit_line(&mut self, line: &str) {
        if self.history.push(line) {
            if let Some(log) = &self.command_log {
                log.log_command(&self.id, line.trim()).await;
            }
        }
        if let Err(e) = self.dispatch(line).await {
            debug!(error = %e, "Command reported an error");
            self.show(&format!("Error: {}", e));
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<(), AppError> {
        match parse_line(line, &self.filter, self.config.max_pipeline_stages)? {
            ParsedLine::Empty => Ok(()),
            ParsedLine::Pipeline(pipeline) => self.run_pipeline(&pipeline).await,
            ParsedLine::Builtin(builtin) => self.run_builtin(builtin).await,
        }
    }

    async fn run_pipeline(&mut self, pipeline: &Pipeline) -> Result<(), AppError> {
        let mut listener = self.control.listen();
        let mut ctx = LoopContext {
            control: &mut listener,
            shutdown: &self.shutdown,
            foreground: &mut self.foreground,
            poll_interval: self.config.poll_interval,
            kill_grace: self.config.kill_grace,
        };
        let mut outcome = self.executor.run(pipeline, &self.cwd, &mut ctx).await?;

        let mut lines = outcome.render(self.config.pipeline_timeout.as_millis());
        if let Some(suspended) = outcome.suspended.take() {
            let id = self.jobs.park_stopped(suspended, pipeline.text());
            lines.push(format!("[{}] Stopped {}", id, pipeline.text()));
        }
        self.show_all(&lines);
        Ok(())
    }

    async fn run_builtin(&mut self, builtin: Builtin) -> Result<(), AppError> {
        match builtin {
            Builtin::Cd(target) => {
                self.cwd = resolve_directory(target.as_deref(), &self.cwd)?;
                debug!(cwd = %self.cwd.display(), "Directory changed");
            }
            Builtin::History => {
                let lines = self.history.listing();
                self.show_all(&lines);
            }
            Builtin::Jobs => {
                let mut lines: Vec<String> = self
                    .jobs
                    .reap()
                    .into_iter()
                    .map(|done| format!("[{}] Done {}", done.id, done.command))
                    .collect();
                let summaries = self.jobs.summaries();
                if summaries.is_empty() {
                    lines.push("No jobs".to_string());
                }
                lines.extend(summaries.iter().map(ToString::to_string));
                self.show_all(&lines);
            }
            Builtin::Fg(requested) => self.resume_foreground(requested).await?,
            Builtin::Bg(requested) => {
                let summary = self.job_control.background(&mut self.jobs, requested)?;
                self.show(&summary.to_string());
            }
            Builtin::MultiWatch(commands) => {
                let mut listener = self.control.listen();
                let mut ctx = LoopContext {
                    control: &mut listener,
                    shutdown: &self.shutdown,
                    foreground: &mut self.foreground,
                    poll_interval: self.config.poll_interval,
                    kill_grace: self.config.kill_grace,
                };
                let report = self
                    .multiwatch
                    .run(&commands, &self.cwd, self.display.as_mut(), &mut ctx)
                    .await?;
                let summary = report.summary(self.config.multiwatch_timeout.as_millis());
                self.show(&summary);
            }
        }
        Ok(())
    }

    async fn resume_foreground(&mut self, requested: Option<u64>) -> Result<(), AppError> {
        let mut listener = self.control.listen();
        let mut ctx = LoopContext {
            control: &mut listener,
            shutdown: &self.shutdown,
            foreground: &mut self.foreground,
            poll_interval: self.config.poll_interval,
            kill_grace: self.config.kill_grace,
        };
        let outcome = self
            .job_control
            .foreground(&mut self.jobs, requested, &mut ctx)
            .await?;

        let mut lines = vec![outcome.command.clone()];
        lines.extend(outcome.run.render(self.config.fg_timeout.as_millis()));
        if outcome.run.status == RunStatus::Stopped {
            lines.push(format!("[{}] Stopped {}", outcome.id, outcome.command));
        }
        self.show_all(&lines);
        Ok(())
    }

    /// Interrupts whatever is running and terminates every job this session owns.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if !self.jobs.is_empty() {
            self.jobs.terminate_all(self.config.kill_grace).await;
        }
        info!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::BufferDisplay;
    use crate::engine::jobs::{JobId, JobStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn session(dir: &TempDir) -> (Session, BufferDisplay) {
        let display = BufferDisplay::new();
        let config = Config {
            kill_grace: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            sink_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let cwd = dunce::canonicalize(dir.path()).unwrap();
        let session = Session::new(Arc::new(config), cwd, Box::new(display.clone()));
        (session, display)
    }

    async fn type_line(session: &mut Session, line: &str) {
        session.handle_input(InputEvent::Insert(line.to_string())).await;
        session.handle_input(InputEvent::Submit).await;
    }

    #[tokio::test]
    async fn pipeline_output_reaches_the_display() {
        let dir = TempDir::new().unwrap();
        let (mut session, display) = session(&dir);
        type_line(&mut session, "echo hello | tr a-z A-Z").await;
        assert_eq!(display.lines(), vec!["HELLO"]);
        assert_eq!(display.prompt(), ("> ".to_string(), 2));
        assert_eq!(session.history.listing(), vec!["    1  echo hello | tr a-z A-Z"]);
    }

    #[tokio::test]
    async fn cd_changes_where_children_run() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (mut session, display) = session(&dir);
        session.submit_line("cd sub").await;
        session.submit_line("pwd").await;
        let expected = session.cwd.display().to_string();
        assert!(expected.ends_with("sub"));
        assert_eq!(display.lines(), vec![expected]);

        display.clear();
        session.submit_line("cd missing").await;
        assert!(display.contents().starts_with("Error: Invalid path"));
    }

    #[tokio::test]
    async fn errors_are_shown_and_the_session_carries_on() {
        let dir = TempDir::new().unwrap();
        let (mut session, display) = session(&dir);
        session.submit_line("fg").await;
        session.submit_line("no-such-program-xyz").await;
        session.submit_line("multiWatch \"echo a\"").await;
        session.submit_line("echo still here").await;
        let lines = display.lines();
        assert_eq!(lines[0], "Error: No current job");
        assert!(lines[1].starts_with("Error: Failed to start 'no-such-program-xyz'"));
        assert!(lines[2].starts_with("Error: Usage: multiWatch"));
        assert_eq!(lines[3], "still here");
    }

    #[tokio::test]
    async fn history_and_jobs_builtins() {
        let dir = TempDir::new().unwrap();
        let (mut session, display) = session(&dir);
        session.submit_line("jobs").await;
        session.submit_line("jobs").await;
        session.submit_line("history").await;
        assert_eq!(
            display.lines(),
            vec!["No jobs", "No jobs", "    1  jobs", "    2  history"]
        );
    }

    #[tokio::test]
    async fn stopped_foreground_becomes_a_job_and_fg_finishes_it() {
        let dir = TempDir::new().unwrap();
        let (mut session, display) = session(&dir);
        let control = session.control_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            control.stop();
        });
        session.submit_line("sleep 1").await;
        assert_eq!(display.lines(), vec!["[1] Stopped sleep 1"]);
        let summaries = session.jobs.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!((summaries[0].id, summaries[0].status), (JobId(1), JobStatus::Stopped));
        assert!(session.foreground.is_none());

        display.clear();
        session.submit_line("fg").await;
        assert_eq!(display.lines(), vec!["sleep 1", "(no output)"]);
        assert!(session.jobs.is_empty());
    }

    #[tokio::test]
    async fn close_terminates_owned_jobs() {
        let dir = TempDir::new().unwrap();
        let (mut session, _display) = session(&dir);
        let control = session.control_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            control.stop();
        });
        session.submit_line("sleep 30").await;
        let pid = session.jobs.summaries()[0].pid;

        session.close().await;
        assert!(session.jobs.is_empty());
        assert!(matches!(
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None),
            Err(nix::errno::Errno::ESRCH)
        ));
    }

    #[tokio::test]
    async fn reverse_search_then_run() {
        let dir = TempDir::new().unwrap();
        let (mut session, display) = session(&dir);
        session.submit_line("echo first").await;
        session.submit_line("echo second").await;
        display.clear();

        session.handle_input(InputEvent::Shortcut(Shortcut::EnterSearch)).await;
        session.handle_input(InputEvent::Insert("fir".to_string())).await;
        assert_eq!(display.prompt().0, "(reverse-i-search)'fir': echo first");
        session.handle_input(InputEvent::Submit).await;
        assert_eq!(display.prompt(), ("> echo first".to_string(), 12));
        session.handle_input(InputEvent::Submit).await;
        assert_eq!(display.lines(), vec!["first"]);
    }

    #[tokio::test]
    async fn tab_completes_against_the_session_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let (mut session, display) = session(&dir);
        session.handle_input(InputEvent::Insert("cat no".to_string())).await;
        session.handle_input(InputEvent::Complete).await;
        assert_eq!(session.editor.line(), "cat notes.txt ");
        assert_eq!(display.prompt().1, 2 + 14);
    }
}
