//! Moderation pattern list.
//! Loads case-insensitive regex patterns from JSON; a message matching any of them
//! is never translated.

use std::path::Path;

use regex::{RegexSet, RegexSetBuilder};
use serde::Deserialize;
use thiserror::Error;

/// On-disk pattern file format.
#[derive(Debug, Deserialize)]
struct PatternFile {
    #[serde(default)]
    version: u32,
    patterns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation list IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("moderation list parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid moderation pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub struct ModerationFilter {
    version: u32,
    set: RegexSet,
}

impl ModerationFilter {
    pub fn load_from_file(path: &Path) -> Result<Self, ModerationError> {
        let content = std::fs::read_to_string(path)?;
        let file: PatternFile = serde_json::from_str(&content)?;
        let mut filter = Self::from_patterns(&file.patterns)?;
        filter.version = file.version;
        Ok(filter)
    }

    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, ModerationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()?;
        Ok(Self { version: 0, set })
    }

    /// Filter that blocks nothing (fallback when the file is missing).
    pub fn empty() -> Self {
        Self {
            version: 0,
            set: RegexSet::empty(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn is_blocked(&self, text: &str) -> bool {
        self.set.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn patterns_match_case_insensitively() {
        let filter = ModerationFilter::from_patterns([r"\bbuy followers\b", "spam+"]).expect("build");
        assert!(filter.is_blocked("BUY FOLLOWERS now"));
        assert!(filter.is_blocked("spammmm"));
        assert!(!filter.is_blocked("hello there"));
    }

    #[test]
    fn empty_filter_blocks_nothing() {
        assert!(!ModerationFilter::empty().is_blocked("anything"));
    }

    #[test]
    fn loads_versioned_file_and_rejects_bad_patterns() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("moderation.json");
        std::fs::write(&path, r#"{"version": 3, "patterns": ["badword"]}"#).expect("write");
        let filter = ModerationFilter::load_from_file(&path).expect("load");
        assert_eq!(filter.version(), 3);
        assert_eq!(filter.len(), 1);

        std::fs::write(&path, r#"{"patterns": ["(unclosed"]}"#).expect("write");
        assert!(matches!(
            ModerationFilter::load_from_file(&path),
            Err(ModerationError::Pattern(_))
        ));
    }
}
