//! Tab completion against the session's current directory.

use crate::error::AppError;
use std::path::Path;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub line: String,
    /// Cursor position in characters.
    pub cursor: usize,
    pub matches: Vec<String>,
    /// Column-formatted match list; empty unless there were several matches.
    pub listing: Vec<String>,
}

/// Start (in characters) of the run of non-space characters ending at `cursor`.
pub fn token_start(chars: &[char], cursor: usize) -> usize {
    let cursor = cursor.min(chars.len());
    chars[..cursor]
        .iter()
        .rposition(|c| c.is_whitespace())
        .map_or(0, |i| i + 1)
}

pub fn longest_common_prefix(words: &[String]) -> String {
    let Some(first) = words.first() else {
        return String::new();
    };
    let mut prefix: Vec<char> = first.chars().collect();
    for word in &words[1..] {
        let common = prefix
            .iter()
            .zip(word.chars())
            .take_while(|(a, b)| **a == *b)
            .count();
        prefix.truncate(common);
    }
    prefix.into_iter().collect()
}

/// Lays `items` out in row-major columns that fit in `width` characters.
pub fn format_columns(items: &[String], width: usize) -> Vec<String> {
    if items.is_empty() {
        return Vec::new();
    }
    let cell = items.iter().map(|i| i.chars().count()).max().unwrap_or(0) + 2;
    let per_row = (width / cell).max(1);
    items
        .chunks(per_row)
        .map(|row| {
            row.iter()
                .map(|item| format!("{:<cell$}", item, cell = cell))
                .collect::<String>()
                .trim_end()
                .to_string()
        })
        .collect()
}

#[instrument(skip(line))]
pub async fn complete(
    line: &str,
    cursor: usize,
    cwd: &Path,
    columns: usize,
) -> Result<Completion, AppError> {
    let chars: Vec<char> = line.chars().collect();
    let cursor = cursor.min(chars.len());
    let start = token_start(&chars, cursor);
    let token: String = chars[start..cursor].iter().collect();

    let mut matches = Vec::new();
    let mut entries = tokio::fs::read_dir(cwd).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') && !token.starts_with('.') {
            continue;
        }
        if name.starts_with(&token) {
            matches.push(name);
        }
    }
    matches.sort();
    debug!(token = %token, matches = matches.len(), "Completion candidates");

    let unchanged = Completion {
        line: line.to_string(),
        cursor,
        matches: Vec::new(),
        listing: Vec::new(),
    };
    let replacement = match matches.len() {
        0 => return Ok(unchanged),
        1 => {
            let mut word = matches[0].clone();
            if !chars.get(cursor).is_some_and(|c| c.is_whitespace()) {
                word.push(' ');
            }
            word
        }
        _ => {
            let prefix = longest_common_prefix(&matches);
            if prefix.chars().count() > token.chars().count() {
                prefix
            } else {
                token.clone()
            }
        }
    };

    let mut new_line: String = chars[..start].iter().collect();
    new_line.push_str(&replacement);
    let new_cursor = new_line.chars().count();
    new_line.extend(&chars[cursor..]);

    let listing = if matches.len() > 1 {
        format_columns(&matches, columns)
    } else {
        Vec::new()
    };
    Ok(Completion {
        line: new_line,
        cursor: new_cursor,
        matches,
        listing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn extends_to_common_prefix_and_lists_matches() {
        let dir = scratch(&["foo.txt", "foobar.txt", "zed"]);
        let result = complete("cat fo", 6, dir.path(), 80).await.unwrap();
        assert_eq!(result.line, "cat foo");
        assert_eq!(result.cursor, 7);
        assert_eq!(result.matches, vec!["foo.txt", "foobar.txt"]);
        assert_eq!(result.listing, vec!["foo.txt     foobar.txt"]);
    }

    #[tokio::test]
    async fn single_match_gets_trailing_space() {
        let dir = scratch(&["readme.md", "src"]);
        let result = complete("cat re", 6, dir.path(), 80).await.unwrap();
        assert_eq!(result.line, "cat readme.md ");
        assert_eq!(result.cursor, 14);
        assert!(result.listing.is_empty());
    }

    #[tokio::test]
    async fn completes_token_in_the_middle_of_the_line() {
        let dir = scratch(&["alpha"]);
        let result = complete("cat al | wc", 6, dir.path(), 80).await.unwrap();
        assert_eq!(result.line, "cat alpha | wc");
        assert_eq!(result.cursor, 9);
    }

    #[tokio::test]
    async fn dot_entries_need_a_dot_token() {
        let dir = scratch(&[".hidden", "visible"]);
        let all = complete("ls ", 3, dir.path(), 80).await.unwrap();
        assert_eq!(all.matches, vec!["visible"]);
        let dotted = complete("ls .h", 5, dir.path(), 80).await.unwrap();
        assert_eq!(dotted.line, "ls .hidden ");
    }

    #[tokio::test]
    async fn no_match_is_a_no_op() {
        let dir = scratch(&["one"]);
        let result = complete("cat x", 5, dir.path(), 80).await.unwrap();
        assert_eq!(result.line, "cat x");
        assert!(result.matches.is_empty());
    }

    #[test]
    fn columns_wrap_to_width() {
        let items: Vec<String> = ["a", "bb", "ccc", "dd"].iter().map(|s| s.to_string()).collect();
        assert_eq!(format_columns(&items, 10), vec!["a    bb", "ccc  dd"]);
        assert_eq!(format_columns(&items, 1).len(), 4);
    }
}
