use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::rule::{next_rule_id, Rule};

/// Default rules file name, resolved next to the executable
pub const RULES_FILE_NAME: &str = "socksfleet_rules.json";

/// Error type for rules file operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rules file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rules file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON array of rules on disk
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store located next to the running executable, or in the current
    /// directory if the executable path cannot be determined
    pub fn beside_executable() -> Self {
        Self::new(default_rules_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all rules. A missing file is an empty fleet.
    ///
    /// Blank ids are backfilled as `rule_<position+1>` and every rule comes
    /// back stopped.
    pub fn load(&self) -> Result<Vec<Rule>, StoreError> {
        if !self.path.exists() {
            info!("Rules file {} does not exist, starting empty", self.path.display());
            return Ok(Vec::new());
        }

        let data = fs::read(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut rules: Vec<Rule> =
            serde_json::from_slice(&data).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })?;

        for i in 0..rules.len() {
            rules[i].running = false;
            if rules[i].id.is_empty() {
                let id = next_rule_id(&rules, i + 1);
                rules[i].id = id;
            }
        }

        info!("Loaded {} rules from {}", rules.len(), self.path.display());
        Ok(rules)
    }

    /// Atomically replace the rules file with `rules`, written as stopped
    pub fn save(&self, rules: &[Rule]) -> Result<(), StoreError> {
        let records: Vec<Rule> = rules
            .iter()
            .map(|rule| Rule {
                running: false,
                ..rule.clone()
            })
            .collect();

        let data = serde_json::to_vec_pretty(&records).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        self.write_atomic(&data).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!("Saved {} rules to {}", records.len(), self.path.display());
        Ok(())
    }

    fn write_atomic(&self, data: &[u8]) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.flush()?;
        drop(f);
        fs::rename(tmp, &self.path)
    }
}

fn default_rules_path() -> PathBuf {
    match std::env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join(RULES_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(RULES_FILE_NAME)),
        Err(e) => {
            tracing::warn!("Cannot resolve executable path ({}), using current directory", e);
            PathBuf::from(RULES_FILE_NAME)
        }
    }
}
