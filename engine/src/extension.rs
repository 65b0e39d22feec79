//! Backup extensions.
//!
//! An extension observes each written entry and/or contributes one named
//! metadata stream appended to the archive at the end of the run. Extension
//! failures are caught and logged by the orchestrator; they never abort a
//! backup, and a missing extension never affects archive correctness.

use std::path::PathBuf;
use std::process::Command;

use crate::config::JobConfig;
use crate::entry::{BackupEntry, MetadataEntry};
use crate::error::EngineError;

/// Pluggable per-entry observer and metadata contributor.
pub trait BackupExtension {
    /// Stable name, used for logging and as the metadata stream name.
    fn name(&self) -> &str;

    /// Called once per entry after a successful archive write.
    fn on_write(&mut self, entry: &BackupEntry) -> Result<(), EngineError>;

    /// Called once at end-of-run; at most one stream per extension.
    fn get_metadata(&mut self) -> Result<Option<MetadataEntry>, EngineError>;
}

/// Captures file permissions by shelling out to an external ACL inventory
/// tool once per source root. The tool's include/exclude arguments are
/// derived from the job's exclusion-rule vocabulary, and its captured
/// standard output becomes the `permissions` metadata stream.
pub struct AclInventoryExtension {
    tool: PathBuf,
    sources: Vec<PathBuf>,
    exclude: Vec<String>,
}

impl AclInventoryExtension {
    pub const NAME: &'static str = "permissions";

    pub fn new(tool: PathBuf, config: &JobConfig) -> Result<Self, EngineError> {
        if !tool.exists() {
            return Err(EngineError::ExtensionFailed {
                name: Self::NAME.to_string(),
                reason: format!("{} can not be found", tool.display()),
            });
        }
        Ok(AclInventoryExtension {
            tool,
            sources: config.sources.clone(),
            exclude: config.exclude.clone(),
        })
    }

    /// Translate exclusion rules into the inventory tool's own arguments.
    /// Regex rules have no equivalent there and are skipped.
    fn exclusion_args(exclude: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        for rule in exclude {
            if rule.starts_with("r/") && rule.ends_with('/') {
                continue;
            }
            if rule.starts_with("x/") && rule.ends_with('/') && rule.len() >= 3 {
                for token in rule[2..rule.len() - 1].split(';').filter(|t| !t.is_empty()) {
                    let dotted = if token.starts_with('.') {
                        token.to_string()
                    } else {
                        format!(".{}", token)
                    };
                    args.push(format!("/objectexclude=*{}", dotted));
                }
            } else {
                args.push(format!("/pathexclude={}", rule));
            }
        }
        args
    }
}

impl BackupExtension for AclInventoryExtension {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_write(&mut self, _entry: &BackupEntry) -> Result<(), EngineError> {
        Ok(())
    }

    fn get_metadata(&mut self) -> Result<Option<MetadataEntry>, EngineError> {
        log::info!("storing file permissions");
        let exclusions = Self::exclusion_args(&self.exclude);

        let mut payload = Vec::new();
        for source in &self.sources {
            let output = Command::new(&self.tool)
                .arg("/noverbose")
                .arg("/nostatistic")
                .arg("/subdirectories")
                .arg(format!(
                    "{}{}*",
                    source.display(),
                    std::path::MAIN_SEPARATOR
                ))
                .arg("/display")
                .args(&exclusions)
                .output()
                .map_err(|e| EngineError::ExtensionFailed {
                    name: Self::NAME.to_string(),
                    reason: format!("failed to run {}: {}", self.tool.display(), e),
                })?;
            payload.extend_from_slice(&output.stdout);
        }

        Ok(Some(MetadataEntry::from_bytes(Self::NAME, payload)))
    }
}
