//! Edit buffer, cursor and reverse-search mode for one session.

use crate::engine::history::{History, SearchMatch};

pub const PROMPT: &str = "> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shortcut {
    NewSession,
    CloseSession,
    NextSession,
    EnterSearch,
    StopForeground,
    InterruptForeground,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Char(char),
    /// Several printable characters at once (paste, or a line from a line-based front end).
    Insert(String),
    Backspace,
    CursorLeft,
    CursorRight,
    /// Tab key.
    Complete,
    Submit,
    Cancel,
    Shortcut(Shortcut),
}

#[derive(Debug, Clone)]
struct SearchState {
    query: String,
    preview: Option<SearchMatch>,
    saved_line: Vec<char>,
    saved_cursor: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LineEditor {
    buffer: Vec<char>,
    cursor: usize,
    search: Option<SearchState>,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self) -> String {
        self.buffer.iter().collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn in_search(&self) -> bool {
        self.search.is_some()
    }

    pub fn search_query(&self) -> Option<&str> {
        self.search.as_ref().map(|s| s.query.as_str())
    }

    pub fn insert(&mut self, c: char) {
        self.buffer.insert(self.cursor, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            self.buffer.remove(self.cursor);
        }
    }

    pub fn move_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn move_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.buffer.len());
    }

    pub fn set_line(&mut self, line: &str, cursor: usize) {
        self.buffer = line.chars().collect();
        self.cursor = cursor.min(self.buffer.len());
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    /// Empties the buffer and hands back what was typed.
    pub fn take_line(&mut self) -> String {
        let line = self.line();
        self.clear();
        line
    }

    pub fn enter_search(&mut self) {
        if self.search.is_none() {
            self.search = Some(SearchState {
                query: String::new(),
                preview: None,
                saved_line: self.buffer.clone(),
                saved_cursor: self.cursor,
            });
        }
    }

    pub fn search_insert(&mut self, c: char, history: &History) {
        if let Some(state) = self.search.as_mut() {
            state.query.push(c);
            state.preview = history.best_match(&state.query);
        }
    }

    pub fn search_backspace(&mut self, history: &History) {
        if let Some(state) = self.search.as_mut() {
            state.query.pop();
            state.preview = history.best_match(&state.query);
        }
    }

    /// Leaves search mode with the previewed entry (if any) as the new buffer.
    pub fn accept_search(&mut self) {
        if let Some(state) = self.search.take() {
            match state.preview {
                Some(found) => {
                    let end = found.entry.chars().count();
                    self.set_line(&found.entry, end);
                }
                None => {
                    self.buffer = state.saved_line;
                    self.cursor = state.saved_cursor;
                }
            }
        }
    }

    /// Leaves search mode restoring the buffer it interrupted.
    pub fn cancel_search(&mut self) {
        if let Some(state) = self.search.take() {
            self.buffer = state.saved_line;
            self.cursor = state.saved_cursor;
        }
    }

    /// Prompt text and cursor offset within it, in characters.
    pub fn prompt(&self) -> (String, usize) {
        match &self.search {
            None => {
                let text = format!("{}{}", PROMPT, self.line());
                (text, PROMPT.chars().count() + self.cursor)
            }
            Some(state) => {
                let preview = state.preview.as_ref().map_or("", |m| m.entry.as_str());
                let head = format!("(reverse-i-search)'{}': ", state.query);
                let cursor = head.chars().count();
                (format!("{}{}", head, preview), cursor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(text: &str) -> LineEditor {
        let mut editor = LineEditor::new();
        text.chars().for_each(|c| editor.insert(c));
        editor
    }

    #[test]
    fn editing_in_the_middle_of_the_line() {
        let mut editor = typed("ehoo");
        editor.move_left();
        editor.move_left();
        editor.backspace();
        editor.insert('c');
        editor.insert('h');
        editor.move_right();
        editor.backspace();
        assert_eq!(editor.line(), "echo");
        assert_eq!(editor.prompt(), ("> echo".to_string(), 5));
    }

    #[test]
    fn search_previews_and_accepts_best_match() {
        let mut history = History::new(100);
        history.push("ls -la");
        history.push("pwd");

        let mut editor = typed("draft");
        editor.enter_search();
        editor.search_insert('l', &history);
        editor.search_insert('s', &history);
        assert_eq!(editor.prompt().0, "(reverse-i-search)'ls': ls -la");
        editor.accept_search();
        assert!(!editor.in_search());
        assert_eq!(editor.line(), "ls -la");
        assert_eq!(editor.cursor(), 6);
    }

    #[test]
    fn cancelled_search_restores_the_draft() {
        let history = History::new(100);
        let mut editor = typed("draft");
        editor.move_left();
        editor.enter_search();
        editor.search_insert('x', &history);
        editor.search_backspace(&history);
        assert_eq!(editor.search_query(), Some(""));
        editor.cancel_search();
        assert_eq!(editor.line(), "draft");
        assert_eq!(editor.cursor(), 4);
    }
}
