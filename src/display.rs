//! Output surface a session writes to. Rendering, wrapping and scrollback
//! belong to the implementor.

use std::io::Write;

pub trait Display: Send {
    /// Pushes output text; embedded newlines start new lines.
    fn append_lines(&mut self, text: &str);

    /// Current prompt text and the cursor offset (in characters) within it.
    fn show_prompt(&mut self, _prompt: &str, _cursor: usize) {}
}

/// In-memory display. Clones share the same line buffer.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct BufferDisplay {
    lines: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    prompt: std::sync::Arc<std::sync::Mutex<(String, usize)>>,
}

#[cfg(test)]
impl BufferDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }

    pub fn prompt(&self) -> (String, usize) {
        self.prompt.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

#[cfg(test)]
impl Display for BufferDisplay {
    fn append_lines(&mut self, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.extend(text.split('\n').map(str::to_string));
        }
    }

    fn show_prompt(&mut self, prompt: &str, cursor: usize) {
        if let Ok(mut p) = self.prompt.lock() {
            *p = (prompt.to_string(), cursor);
        }
    }
}

/// Writes to the process stdout, tagging each line with its tab number.
/// The prompt is printed as its own line whenever it changes.
#[derive(Debug)]
pub struct StdoutDisplay {
    tab: usize,
    last_prompt: String,
}

impl StdoutDisplay {
    pub fn new(tab: usize) -> Self {
        Self {
            tab,
            last_prompt: String::new(),
        }
    }
}

impl Display for StdoutDisplay {
    fn append_lines(&mut self, text: &str) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for line in text.split('\n') {
            let _ = writeln!(out, "[{}] {}", self.tab, line);
        }
        let _ = out.flush();
        // Output pushed the old prompt off screen.
        self.last_prompt.clear();
    }

    fn show_prompt(&mut self, prompt: &str, _cursor: usize) {
        if prompt == self.last_prompt {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "[{}] {}", self.tab, prompt);
        let _ = out.flush();
        self.last_prompt = prompt.to_string();
    }
}
