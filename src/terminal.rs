//! Tab manager. Each tab's `Session` lives in its own task and is fed input
//! over a channel; interrupt and stop requests skip the queue so they reach a
//! session that is busy supervising a command.

use crate::config::Config;
use crate::display::Display;
use crate::engine::control::ControlHandle;
use crate::session::editor::{InputEvent, Shortcut};
use crate::session::Session;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug)]
pub enum SessionMessage {
    Input(InputEvent),
    Close,
}

/// Builds the display for a new tab, given its tab number.
pub type DisplayFactory = Box<dyn Fn(usize) -> Box<dyn Display> + Send + Sync>;

struct Tab {
    number: usize,
    session_id: String,
    tx: mpsc::UnboundedSender<SessionMessage>,
    control: ControlHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Terminal {
    config: Arc<Config>,
    start_dir: PathBuf,
    make_display: DisplayFactory,
    tabs: Vec<Tab>,
    active: usize,
    next_number: usize,
}

async fn run_session(mut session: Session, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            SessionMessage::Input(event) => session.handle_input(event).await,
            SessionMessage::Close => break,
        }
    }
    session.close().await;
}

impl Terminal {
    pub fn new(config: Arc<Config>, start_dir: PathBuf, make_display: DisplayFactory) -> Self {
        Self {
            config,
            start_dir,
            make_display,
            tabs: Vec::new(),
            active: 0,
            next_number: 1,
        }
    }

    /// Number of the active tab, if any tab is open.
    pub fn active_tab(&self) -> Option<usize> {
        self.tabs.get(self.active).map(|t| t.number)
    }

    /// Opens a tab, makes it active and returns its number.
    pub fn open_tab(&mut self) -> usize {
        let number = self.next_number;
        self.next_number += 1;

        let display = (self.make_display)(number);
        let session = Session::new(self.config.clone(), self.start_dir.clone(), display);
        let session_id = session.id().to_string();
        let control = session.control_handle();
        let shutdown = session.shutdown_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(session, rx));

        info!(tab = number, session_id = %session_id, "Tab opened");
        self.tabs.push(Tab {
            number,
            session_id,
            tx,
            control,
            shutdown,
            task,
        });
        self.active = self.tabs.len() - 1;
        number
    }

    pub fn next_tab(&mut self) {
        if !self.tabs.is_empty() {
            self.active = (self.active + 1) % self.tabs.len();
            debug!(tab = ?self.active_tab(), "Switched tab");
        }
    }

    /// Closes the active tab, waiting until its session has reaped everything it owned.
    pub async fn close_active(&mut self) {
        if self.tabs.is_empty() {
            return;
        }
        let tab = self.tabs.remove(self.active);
        if self.active >= self.tabs.len() {
            self.active = self.tabs.len().saturating_sub(1);
        }
        close_tab(tab).await;
    }

    /// Routes one event. Returns false once the last tab is gone.
    pub async fn dispatch(&mut self, event: InputEvent) -> bool {
        match event {
            InputEvent::Shortcut(Shortcut::NewSession) => {
                self.open_tab();
            }
            InputEvent::Shortcut(Shortcut::CloseSession) => self.close_active().await,
            InputEvent::Shortcut(Shortcut::NextSession) => self.next_tab(),
            InputEvent::Shortcut(Shortcut::InterruptForeground) => {
                if let Some(tab) = self.tabs.get(self.active) {
                    tab.control.interrupt();
                }
            }
            InputEvent::Shortcut(Shortcut::StopForeground) => {
                if let Some(tab) = self.tabs.get(self.active) {
                    tab.control.stop();
                }
            }
            other => {
                if let Some(tab) = self.tabs.get(self.active) {
                    if tab.tx.send(SessionMessage::Input(other)).is_err() {
                        warn!(tab = tab.number, "Session task is gone, input dropped");
                    }
                }
            }
        }
        !self.tabs.is_empty()
    }

    #[instrument(skip(self), fields(tabs = self.tabs.len()))]
    pub async fn shutdown(&mut self) {
        for tab in self.tabs.drain(..) {
            close_tab(tab).await;
        }
        self.active = 0;
    }
}

async fn close_tab(tab: Tab) {
    tab.shutdown.cancel();
    let _ = tab.tx.send(SessionMessage::Close);
    if let Err(e) = tab.task.await {
        warn!(tab = tab.number, error = %e, "Session task failed");
    }
    info!(tab = tab.number, session_id = %tab.session_id, "Tab closed");
}
