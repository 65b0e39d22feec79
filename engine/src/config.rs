//! Job configuration.
//!
//! Job files are JSON documents holding either one job object or an array of
//! them:
//!
//! ```json
//! {
//!   "name": "documents",
//!   "options": { "target": "backups/{name}_{date}", "date_format": "%d-%m-%Y" },
//!   "flags": { "recursive": true, "incremental": false },
//!   "sources": ["/home/user/documents"],
//!   "exclude": ["x/tmp;bak/", "r/~\\$/"]
//! }
//! ```
//!
//! The raw document is validated into an immutable `JobConfig` before a run
//! begins: exclusion rules are compiled, the archive format is resolved and
//! the target template is expanded. Nothing mutates the configuration during
//! execution.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use serde::Deserialize;

use crate::error::EngineError;
use crate::filter::RuleSet;

const DEFAULT_NAME: &str = "Default";
const DEFAULT_DATE_FORMAT: &str = "%d-%m-%Y";
const DEFAULT_TARGET: &str = "backup_{date}";

/// The archive container to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
}

impl ArchiveFormat {
    fn parse(text: &str) -> Result<Self, EngineError> {
        match text {
            "zip" => Ok(ArchiveFormat::Zip),
            other => Err(EngineError::Configuration {
                reason: format!("unsupported archive format `{}`", other),
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawOptions {
    format: Option<String>,
    date_format: Option<String>,
    target: Option<String>,
    acl_tool: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFlags {
    recursive: Option<bool>,
    #[serde(alias = "incrementalMode")]
    incremental: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    name: Option<String>,
    #[serde(default)]
    options: RawOptions,
    #[serde(default)]
    flags: RawFlags,
    #[serde(default)]
    sources: Vec<PathBuf>,
    #[serde(default)]
    exclude: Vec<String>,
}

/// Validated, immutable configuration of one backup job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Display name, substituted for `{name}` in the target template
    pub name: String,

    /// Ordered source paths; at least one
    pub sources: Vec<PathBuf>,

    /// Raw exclusion rule strings, kept for collaborators that translate
    /// them into their own vocabulary (see the permission-capture extension)
    pub exclude: Vec<String>,

    /// Compiled exclusion rules
    pub rules: RuleSet,

    /// Descend into subdirectories
    pub recursive: bool,

    /// Incremental mode: skip files without the archive attribute
    pub incremental: bool,

    /// Archive engine to use
    pub format: ArchiveFormat,

    /// Resolved target artifact path
    pub target: PathBuf,

    /// Optional path to the external ACL inventory tool; enables the
    /// permission-capture extension when present
    pub acl_tool: Option<PathBuf>,
}

impl JobConfig {
    /// Load every job from a JSON file (one object or an array of objects).
    pub fn load_file(path: &Path) -> Result<Vec<JobConfig>, EngineError> {
        let text = fs::read_to_string(path).map_err(|e| EngineError::Configuration {
            reason: format!("cannot read `{}`: {}", path.display(), e),
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| EngineError::Configuration {
                reason: format!("cannot parse `{}`: {}", path.display(), e),
            })?;

        let raw_jobs: Vec<serde_json::Value> = match value {
            serde_json::Value::Array(items) => items,
            object @ serde_json::Value::Object(_) => vec![object],
            _ => {
                return Err(EngineError::Configuration {
                    reason: format!("`{}` must hold a job object or an array", path.display()),
                })
            }
        };

        raw_jobs.iter().map(JobConfig::from_value).collect()
    }

    /// Validate a single job document.
    pub fn from_value(value: &serde_json::Value) -> Result<JobConfig, EngineError> {
        let raw: RawJob =
            serde_json::from_value(value.clone()).map_err(|e| EngineError::Configuration {
                reason: format!("malformed job document: {}", e),
            })?;
        Self::validate(raw, &Local::now())
    }

    fn validate(raw: RawJob, now: &DateTime<Local>) -> Result<JobConfig, EngineError> {
        if raw.sources.is_empty() {
            return Err(EngineError::Configuration {
                reason: "no sources specified".to_string(),
            });
        }

        let name = raw.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let format = ArchiveFormat::parse(raw.options.format.as_deref().unwrap_or("zip"))?;

        let date_format = raw
            .options
            .date_format
            .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
        validate_date_format(&date_format)?;

        let template = raw
            .options
            .target
            .unwrap_or_else(|| DEFAULT_TARGET.to_string());
        if template.trim().is_empty() {
            return Err(EngineError::Configuration {
                reason: "no target specified".to_string(),
            });
        }
        let target = PathBuf::from(resolve_target(&template, &name, &date_format, now));

        let rules = RuleSet::parse(&raw.exclude)?;

        Ok(JobConfig {
            name,
            sources: raw.sources,
            exclude: raw.exclude,
            rules,
            recursive: raw.flags.recursive.unwrap_or(true),
            incremental: raw.flags.incremental.unwrap_or(false),
            format,
            target,
            acl_tool: raw.options.acl_tool,
        })
    }
}

/// Expand the target template: append the archive suffix, then substitute
/// the `{name}` and `{date}` tokens.
fn resolve_target(template: &str, name: &str, date_format: &str, now: &DateTime<Local>) -> String {
    let mut target = template.to_string();
    target.push_str(".zip");
    target
        .replace("{name}", name)
        .replace("{date}", &now.format(date_format).to_string())
}

fn validate_date_format(pattern: &str) -> Result<(), EngineError> {
    let has_error = StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error));
    if has_error {
        return Err(EngineError::Configuration {
            reason: format!("invalid date format `{}`", pattern),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn sample_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_defaults_applied_to_minimal_job() {
        let value = serde_json::json!({ "sources": ["/data"] });
        let config = JobConfig::from_value(&value).expect("Failed to validate job");

        assert_eq!(config.name, "Default");
        assert!(config.recursive);
        assert!(!config.incremental);
        assert_eq!(config.format, ArchiveFormat::Zip);
        assert!(config.rules.is_empty());
        assert!(config.acl_tool.is_none());
    }

    #[test]
    fn test_missing_sources_rejected() {
        let value = serde_json::json!({ "name": "empty" });
        let result = JobConfig::from_value(&value);
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let value = serde_json::json!({
            "sources": ["/data"],
            "options": { "format": "7z" }
        });
        let result = JobConfig::from_value(&value);
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_malformed_exclusion_rule_rejected() {
        let value = serde_json::json!({
            "sources": ["/data"],
            "exclude": ["r/(unclosed/"]
        });
        let result = JobConfig::from_value(&value);
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_target_template_substitution() {
        let resolved = resolve_target("backups/{name}_{date}", "docs", "%d-%m-%Y", &sample_time());
        assert_eq!(resolved, "backups/docs_09-03-2024.zip");
    }

    #[test]
    fn test_target_suffix_appended_before_substitution() {
        let resolved = resolve_target("{name}", "job", "%Y", &sample_time());
        assert_eq!(resolved, "job.zip");
    }

    #[test]
    fn test_invalid_date_format_rejected() {
        let value = serde_json::json!({
            "sources": ["/data"],
            "options": { "date_format": "%Q" }
        });
        let result = JobConfig::from_value(&value);
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_load_file_with_single_object() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("job.json");
        let mut file = fs::File::create(&path).expect("Failed to create file");
        file.write_all(br#"{ "name": "one", "sources": ["/data"] }"#)
            .expect("Failed to write file");
        drop(file);

        let configs = JobConfig::load_file(&path).expect("Failed to load file");
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "one");
    }

    #[test]
    fn test_load_file_with_array() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("jobs.json");
        fs::write(
            &path,
            br#"[
                { "name": "a", "sources": ["/data/a"] },
                { "name": "b", "sources": ["/data/b"], "flags": { "incremental": true } }
            ]"#,
        )
        .expect("Failed to write file");

        let configs = JobConfig::load_file(&path).expect("Failed to load file");
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].name, "b");
        assert!(configs[1].incremental);
    }

    #[test]
    fn test_load_file_rejects_scalar_document() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("job.json");
        fs::write(&path, b"42").expect("Failed to write file");

        let result = JobConfig::load_file(&path);
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn test_load_file_missing_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = JobConfig::load_file(&temp_dir.path().join("nope.json"));
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }
}
