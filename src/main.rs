mod config;
mod display;
mod engine;
mod error;
mod session;
mod terminal;
mod utils;

use crate::config::Config;
use crate::display::{Display, StdoutDisplay};
use crate::session::editor::{InputEvent, Shortcut};
use crate::terminal::Terminal;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tabshell={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

/// Maps one stdin line onto input events.
///
/// Plain lines are typed into the active tab and submitted. `:new`, `:close`
/// and `:next` manage tabs, `:search <query>` runs the best history match and
/// `:complete <partial>` leaves the completed text in the edit buffer, so the
/// next line (even an empty one) is appended to it.
fn line_to_events(line: &str) -> Vec<InputEvent> {
    let (word, rest) = match line.split_once(' ') {
        Some((word, rest)) => (word, rest),
        None => (line, ""),
    };
    let mut events = match word {
        ":new" => return vec![InputEvent::Shortcut(Shortcut::NewSession)],
        ":close" => return vec![InputEvent::Shortcut(Shortcut::CloseSession)],
        ":next" => return vec![InputEvent::Shortcut(Shortcut::NextSession)],
        ":search" => {
            let mut events = vec![InputEvent::Shortcut(Shortcut::EnterSearch)];
            events.extend(typed_events(rest));
            events.extend([InputEvent::Submit, InputEvent::Submit]);
            return events;
        }
        ":complete" => {
            let mut events = typed_events(rest);
            events.push(InputEvent::Complete);
            return events;
        }
        _ => typed_events(line),
    };
    events.push(InputEvent::Submit);
    events
}

/// Typed text with control bytes acting as editing keys: `^H` or DEL erases,
/// `^B`/`^F` move the cursor and `^G` abandons the line or the search.
fn typed_events(text: &str) -> Vec<InputEvent> {
    let mut events = Vec::new();
    let mut run = String::new();
    for c in text.chars() {
        let key = match c {
            '\u{8}' | '\u{7f}' => InputEvent::Backspace,
            '\u{2}' => InputEvent::CursorLeft,
            '\u{6}' => InputEvent::CursorRight,
            '\u{7}' => InputEvent::Cancel,
            _ => {
                run.push(c);
                continue;
            }
        };
        flush_typed(&mut run, &mut events);
        events.push(key);
    }
    flush_typed(&mut run, &mut events);
    events
}

fn flush_typed(run: &mut String, events: &mut Vec<InputEvent>) {
    let mut chars = run.chars();
    match (chars.next(), chars.next()) {
        (None, _) => {}
        (Some(c), None) => events.push(InputEvent::Char(c)),
        _ => events.push(InputEvent::Insert(std::mem::take(run))),
    }
    run.clear();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load().context("Failed to load configuration")?);
    setup_logging(&config.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "tabshell starting");

    let start_dir = std::env::current_dir().context("Failed to read the current directory")?;
    let mut terminal = Terminal::new(
        config,
        start_dir,
        Box::new(|tab: usize| -> Box<dyn Display> { Box::new(StdoutDisplay::new(tab)) }),
    );
    terminal.open_tab();

    let mut interrupts = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let mut stops = signal(SignalKind::from_raw(nix::libc::SIGTSTP))
        .context("Failed to listen for SIGTSTP")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    'input: loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break 'input;
                };
                for event in line_to_events(&line) {
                    if !terminal.dispatch(event).await {
                        break 'input;
                    }
                }
            }
            _ = interrupts.recv() => {
                terminal.dispatch(InputEvent::Shortcut(Shortcut::InterruptForeground)).await;
            }
            _ = stops.recv() => {
                terminal.dispatch(InputEvent::Shortcut(Shortcut::StopForeground)).await;
            }
        }
    }

    terminal.shutdown().await;
    info!("tabshell exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_end_lines_map_to_events() {
        assert_eq!(
            line_to_events("ls | wc -l"),
            vec![InputEvent::Insert("ls | wc -l".to_string()), InputEvent::Submit]
        );
        assert_eq!(
            line_to_events(":new"),
            vec![InputEvent::Shortcut(Shortcut::NewSession)]
        );
        assert_eq!(
            line_to_events(":complete cat fo"),
            vec![InputEvent::Insert("cat fo".to_string()), InputEvent::Complete]
        );
        assert_eq!(line_to_events(":search ls")[1], InputEvent::Insert("ls".to_string()));
    }

    #[test]
    fn control_bytes_become_editing_keys() {
        assert_eq!(
            line_to_events("ecx\u{7f}ho\u{2}\u{2}\u{6}"),
            vec![
                InputEvent::Insert("ecx".to_string()),
                InputEvent::Backspace,
                InputEvent::Insert("ho".to_string()),
                InputEvent::CursorLeft,
                InputEvent::CursorLeft,
                InputEvent::CursorRight,
                InputEvent::Submit,
            ]
        );
        assert_eq!(
            line_to_events("x\u{7}"),
            vec![InputEvent::Char('x'), InputEvent::Cancel, InputEvent::Submit]
        );
    }
}
