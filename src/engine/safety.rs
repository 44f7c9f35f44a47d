use crate::config::Config;
use crate::error::AppError;
use regex::Regex;
use tracing::warn;

/// Static denylist applied to command text before anything is spawned.
#[derive(Debug, Clone, Default)]
pub struct SafetyFilter {
    patterns: Vec<Regex>,
}

impl SafetyFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.blocked_commands.clone())
    }

    pub fn is_blocked(&self, command_str: &str) -> bool {
        let trimmed = command_str.trim();
        self.patterns.iter().any(|regex| regex.is_match(trimmed))
    }

    pub fn check(&self, command_str: &str) -> Result<(), AppError> {
        if self.is_blocked(command_str) {
            warn!(command = %command_str, "Command execution blocked");
            return Err(AppError::CommandBlocked(command_str.trim().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile_blocked_commands;

    #[test]
    fn blocks_listed_command_with_assignments() {
        let filter = SafetyFilter::new(compile_blocked_commands("shutdown").unwrap());
        assert!(filter.check("  shutdown -h now").is_err());
        assert!(filter.check("LANG=C shutdown").is_err());
        assert!(filter.check("echo shutdown").is_ok());
    }
}
