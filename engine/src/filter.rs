//! Exclusion filters.
//!
//! Rules come from the job configuration as plain strings with a recognized
//! prefix/suffix convention:
//! - `r/<pattern>/` - regular expression, matched anywhere in the real path
//! - `x/<ext1;ext2;...>/` - file extensions, case-insensitive
//! - anything else - literal path prefix
//!
//! Two filter strategies exist: `FullBackupFilter` evaluates only the rules,
//! `IncrementalBackupFilter` first excludes files whose archive attribute is
//! unset. The active strategy is selected once at orchestrator construction.

use std::path::Path;

use regex::Regex;

use crate::entry::BackupEntry;
use crate::error::EngineError;

/// One parsed exclusion rule. First matching rule wins.
#[derive(Debug, Clone)]
pub enum Rule {
    /// `r/<pattern>/` - matches anywhere in the path
    Pattern(Regex),
    /// `x/<ext;ext>/` - path ends with one of the dotted extensions
    Extensions(Vec<String>),
    /// Literal prefix match
    Prefix(String),
}

impl Rule {
    /// Parse a single rule string. Malformed regex patterns are a
    /// configuration error; everything unrecognized is a prefix rule.
    pub fn parse(text: &str) -> Result<Rule, EngineError> {
        if let Some(body) = rule_body(text, 'r') {
            let pattern = Regex::new(body).map_err(|e| EngineError::Configuration {
                reason: format!("invalid regex rule `{}`: {}", text, e),
            })?;
            Ok(Rule::Pattern(pattern))
        } else if let Some(body) = rule_body(text, 'x') {
            let extensions = body
                .split(';')
                .filter(|token| !token.is_empty())
                .map(|token| {
                    if token.starts_with('.') {
                        token.to_lowercase()
                    } else {
                        format!(".{}", token.to_lowercase())
                    }
                })
                .collect();
            Ok(Rule::Extensions(extensions))
        } else {
            Ok(Rule::Prefix(text.to_string()))
        }
    }

    /// Check the rule against a real (translated) path.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Rule::Pattern(pattern) => pattern.is_match(path),
            Rule::Extensions(extensions) => {
                let lower = path.to_lowercase();
                extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
            }
            Rule::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

fn rule_body(text: &str, tag: char) -> Option<&str> {
    let rest = text.strip_prefix(tag)?.strip_prefix('/')?;
    rest.strip_suffix('/')
}

/// The compiled rules of one job, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile a list of rule strings. Fails on the first malformed rule.
    pub fn parse(texts: &[String]) -> Result<Self, EngineError> {
        let rules = texts
            .iter()
            .map(|text| Rule::parse(text))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleSet { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when any rule matches the path.
    pub fn matches(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.rules.iter().any(|rule| rule.matches(&text))
    }
}

/// Per-entry inclusion policy, polymorphic over the backup mode.
pub trait ExclusionFilter {
    fn is_dir_excluded(&self, entry: &BackupEntry) -> bool;
    fn is_file_excluded(&self, entry: &BackupEntry) -> bool;
}

/// Full-backup policy: only the configured rules apply.
pub struct FullBackupFilter {
    rules: RuleSet,
}

impl FullBackupFilter {
    pub fn new(rules: RuleSet) -> Self {
        FullBackupFilter { rules }
    }
}

impl ExclusionFilter for FullBackupFilter {
    // Directories are never rule-excluded; pruning happens upstream via
    // symlink/reparse detection.
    fn is_dir_excluded(&self, _entry: &BackupEntry) -> bool {
        false
    }

    fn is_file_excluded(&self, entry: &BackupEntry) -> bool {
        self.rules.matches(&entry.real_path)
    }
}

/// Incremental policy: a file without the archive attribute has not changed
/// since the last full backup and is excluded before any rule check.
pub struct IncrementalBackupFilter {
    inner: FullBackupFilter,
}

impl IncrementalBackupFilter {
    pub fn new(rules: RuleSet) -> Self {
        IncrementalBackupFilter {
            inner: FullBackupFilter::new(rules),
        }
    }
}

impl ExclusionFilter for IncrementalBackupFilter {
    fn is_dir_excluded(&self, entry: &BackupEntry) -> bool {
        self.inner.is_dir_excluded(entry)
    }

    fn is_file_excluded(&self, entry: &BackupEntry) -> bool {
        if !entry.has_archive_attribute() {
            return true;
        }
        self.inner.is_file_excluded(entry)
    }
}
