//! Command-line parsing: built-in detection, pipe splitting, `<`/`>` redirection.
//!
//! The grammar is deliberately small. There is no quoting inside pipelines, no
//! variable expansion and no control flow; tokens are separated by whitespace
//! and `|` always separates stages.

use crate::engine::safety::SafetyFilter;
use crate::error::AppError;
use std::path::PathBuf;

pub const MULTIWATCH_MIN: usize = 2;
pub const MULTIWATCH_MAX: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub argv: Vec<String>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// Non-empty ordered list of stages plus the line it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
    text: String,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    Cd(Option<String>),
    History,
    Jobs,
    Fg(Option<u64>),
    Bg(Option<u64>),
    MultiWatch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Empty,
    Builtin(Builtin),
    Pipeline(Pipeline),
}

pub fn parse_line(
    line: &str,
    filter: &SafetyFilter,
    max_stages: usize,
) -> Result<ParsedLine, AppError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ParsedLine::Empty);
    }

    if let Some(builtin) = parse_builtin(trimmed, filter)? {
        return Ok(ParsedLine::Builtin(builtin));
    }

    parse_pipeline(trimmed, filter, max_stages).map(ParsedLine::Pipeline)
}

fn parse_builtin(line: &str, filter: &SafetyFilter) -> Result<Option<Builtin>, AppError> {
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let builtin = match word {
        "cd" => match args.as_slice() {
            [] => Builtin::Cd(None),
            [dir] => Builtin::Cd(Some(dir.to_string())),
            _ => return Err(AppError::usage("cd [dir]")),
        },
        "history" if args.is_empty() => Builtin::History,
        "history" => return Err(AppError::usage("history")),
        "jobs" if args.is_empty() => Builtin::Jobs,
        "jobs" => return Err(AppError::usage("jobs")),
        "fg" => Builtin::Fg(parse_job_arg("fg", &args)?),
        "bg" => Builtin::Bg(parse_job_arg("bg", &args)?),
        "multiWatch" => {
            let commands = parse_quoted_commands(rest)?;
            for command in &commands {
                filter.check(command)?;
            }
            Builtin::MultiWatch(commands)
        }
        _ => return Ok(None),
    };
    Ok(Some(builtin))
}

fn parse_job_arg(name: &str, args: &[&str]) -> Result<Option<u64>, AppError> {
    match args {
        [] => Ok(None),
        [raw] => raw
            .trim_start_matches('%')
            .parse::<u64>()
            .map(Some)
            .map_err(|_| AppError::usage(format!("{} [job_id] (got '{}')", name, raw))),
        _ => Err(AppError::usage(format!("{} [job_id]", name))),
    }
}

/// Parses `"cmd1" "cmd2" ...`. Every command must be double-quoted.
pub fn parse_quoted_commands(input: &str) -> Result<Vec<String>, AppError> {
    const USAGE: &str = "multiWatch \"cmd1\" \"cmd2\" ... (2 to 10 quoted commands)";

    let mut commands = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => break,
            Some('"') => {
                let mut command = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    command.push(c);
                }
                if !closed {
                    return Err(AppError::usage(format!("unclosed quote; {}", USAGE)));
                }
                let command = command.trim().to_string();
                if command.is_empty() {
                    return Err(AppError::usage(format!("empty command; {}", USAGE)));
                }
                commands.push(command);
            }
            Some(_) => return Err(AppError::usage(format!("unquoted command; {}", USAGE))),
        }
    }

    if commands.len() < MULTIWATCH_MIN {
        return Err(AppError::usage(USAGE));
    }
    if commands.len() > MULTIWATCH_MAX {
        return Err(AppError::usage(format!(
            "too many commands ({}, max {}); {}",
            commands.len(),
            MULTIWATCH_MAX,
            USAGE
        )));
    }
    Ok(commands)
}

fn parse_pipeline(
    line: &str,
    filter: &SafetyFilter,
    max_stages: usize,
) -> Result<Pipeline, AppError> {
    let segments: Vec<&str> = line.split('|').collect();
    if segments.len() > max_stages {
        return Err(AppError::usage(format!(
            "too many stages ({}, max {})",
            segments.len(),
            max_stages
        )));
    }

    let mut stages = Vec::with_capacity(segments.len());
    for segment in segments {
        filter.check(segment)?;
        stages.push(parse_stage(segment)?);
    }

    Ok(Pipeline {
        stages,
        text: line.to_string(),
    })
}

fn parse_stage(segment: &str) -> Result<Stage, AppError> {
    let mut argv = Vec::new();
    let mut input = None;
    let mut output = None;

    let mut tokens = segment.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "<" | ">" => {
                let target = tokens.next().ok_or_else(|| {
                    AppError::usage(format!("missing redirection target after '{}'", token))
                })?;
                if token == "<" {
                    input = Some(PathBuf::from(target));
                } else {
                    output = Some(PathBuf::from(target));
                }
            }
            _ => argv.push(token.to_string()),
        }
    }

    if argv.is_empty() {
        return Err(AppError::usage("no command specified"));
    }
    Ok(Stage { argv, input, output })
}

/// Splits on whitespace; used for commands that are exec'd without a shell.
pub fn tokenize(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<ParsedLine, AppError> {
        parse_line(line, &SafetyFilter::default(), 16)
    }

    fn pipeline(line: &str) -> Pipeline {
        match parse(line).unwrap() {
            ParsedLine::Pipeline(p) => p,
            other => panic!("expected pipeline, got {:?}", other),
        }
    }

    #[test]
    fn blank_line_is_empty() {
        assert_eq!(parse("   ").unwrap(), ParsedLine::Empty);
    }

    #[test]
    fn single_stage_with_redirections() {
        let p = pipeline("sort < in.txt > out.txt");
        assert_eq!(p.len(), 1);
        let stage = &p.stages()[0];
        assert_eq!(stage.argv, vec!["sort"]);
        assert_eq!(stage.input, Some(PathBuf::from("in.txt")));
        assert_eq!(stage.output, Some(PathBuf::from("out.txt")));
    }

    #[test]
    fn pipe_splits_and_trims_stages() {
        let p = pipeline("ls -la |grep foo| wc -l");
        let argvs: Vec<_> = p.stages().iter().map(|s| s.argv.join(" ")).collect();
        assert_eq!(argvs, vec!["ls -la", "grep foo", "wc -l"]);
        assert_eq!(p.text(), "ls -la |grep foo| wc -l");
    }

    #[test]
    fn empty_stage_is_reported() {
        let err = parse("ls | | wc").unwrap_err();
        assert!(err.to_string().contains("no command specified"));
        let err = parse("> out.txt").unwrap_err();
        assert!(err.to_string().contains("no command specified"));
    }

    #[test]
    fn too_many_stages_is_an_error_not_truncation() {
        let line = vec!["cat"; 17].join(" | ");
        let err = parse(&line).unwrap_err();
        assert!(err.to_string().contains("too many stages"));
        let line = vec!["cat"; 16].join(" | ");
        assert_eq!(pipeline(&line).len(), 16);
    }

    #[test]
    fn missing_redirect_target() {
        assert!(parse("cat <").is_err());
    }

    #[test]
    fn builtins_bypass_pipeline_parsing() {
        assert_eq!(parse("cd").unwrap(), ParsedLine::Builtin(Builtin::Cd(None)));
        assert_eq!(
            parse("cd /tmp | wc").unwrap_err().to_string(),
            AppError::usage("cd [dir]").to_string()
        );
        assert_eq!(parse("jobs").unwrap(), ParsedLine::Builtin(Builtin::Jobs));
        assert_eq!(parse("history").unwrap(), ParsedLine::Builtin(Builtin::History));
        assert_eq!(parse("fg").unwrap(), ParsedLine::Builtin(Builtin::Fg(None)));
        assert_eq!(parse("fg %3").unwrap(), ParsedLine::Builtin(Builtin::Fg(Some(3))));
        assert_eq!(parse("bg 2").unwrap(), ParsedLine::Builtin(Builtin::Bg(Some(2))));
        assert!(parse("fg x").is_err());
    }

    #[test]
    fn multiwatch_requires_quoted_commands() {
        assert_eq!(
            parse(r#"multiWatch "echo a" "ls | wc -l""#).unwrap(),
            ParsedLine::Builtin(Builtin::MultiWatch(vec![
                "echo a".to_string(),
                "ls | wc -l".to_string()
            ]))
        );
        assert!(parse(r#"multiWatch echo "ls""#).is_err());
        assert!(parse(r#"multiWatch "echo a" "ls"#).is_err());
        assert!(parse(r#"multiWatch "echo a""#).is_err());
        let eleven = vec!["\"true\""; 11].join(" ");
        assert!(parse(&format!("multiWatch {}", eleven)).is_err());
    }

    #[test]
    fn safety_filter_applies_to_every_stage() {
        let filter = SafetyFilter::new(crate::config::compile_blocked_commands("sudo").unwrap());
        assert!(matches!(
            parse_line("ls | sudo tee x", &filter, 16),
            Err(AppError::CommandBlocked(_))
        ));
        assert!(matches!(
            parse_line(r#"multiWatch "ls" "sudo ls""#, &filter, 16),
            Err(AppError::CommandBlocked(_))
        ));
    }
}
