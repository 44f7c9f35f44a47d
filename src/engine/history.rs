//! Bounded command history with reverse search.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub entry: String,
    /// Position in the history, oldest entry is 0.
    pub index: usize,
    pub score: usize,
}

#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<String>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records a line. Blank lines and a repeat of the last entry are dropped.
    pub fn push(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || self.entries.back().is_some_and(|last| last == line) {
            return false;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line.to_string());
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// `history` output: numbered from 1, oldest first.
    pub fn listing(&self) -> Vec<String> {
        self.entries()
            .enumerate()
            .map(|(i, entry)| format!("{:>5}  {}", i + 1, entry))
            .collect()
    }

    fn scored_newest_first<'a>(&'a self, query: &'a str) -> impl Iterator<Item = SearchMatch> + 'a {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .filter_map(move |(index, entry)| {
                let score = score(query, entry);
                (score > 0).then(|| SearchMatch {
                    entry: entry.clone(),
                    index,
                    score,
                })
            })
    }

    /// Single best match for incremental preview. Ties go to the newest entry.
    pub fn best_match(&self, query: &str) -> Option<SearchMatch> {
        if query.is_empty() {
            return None;
        }
        let mut best: Option<SearchMatch> = None;
        for candidate in self.scored_newest_first(query) {
            if best.as_ref().map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }
        best
    }

    /// Every entry scoring at least 1, newest first.
    pub fn candidates(&self, query: &str) -> Vec<SearchMatch> {
        if query.is_empty() {
            return Vec::new();
        }
        self.scored_newest_first(query).collect()
    }
}

/// Exact substring, then case-insensitive substring, then longest common run.
pub fn score(query: &str, entry: &str) -> usize {
    let query_len = query.chars().count();
    if entry.contains(query) {
        return query_len;
    }
    let query_lower = query.to_lowercase();
    let entry_lower = entry.to_lowercase();
    if entry_lower.contains(&query_lower) {
        return query_len;
    }
    longest_common_run(&query_lower, &entry_lower)
}

fn longest_common_run(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Rolling row of the classic DP table.
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    let mut longest = 0;
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb { previous[j] + 1 } else { 0 };
            longest = longest.max(current[j + 1]);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    longest
}
