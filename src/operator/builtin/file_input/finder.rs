use glob::{glob, Pattern};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Finder resolves the include/exclude glob patterns to the set of files
/// that should be tailed.
#[derive(Debug, Clone)]
pub struct Finder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl Finder {
    /// Both pattern lists are validated here so a bad pattern fails the
    /// build instead of every poll.
    pub fn new(include: Vec<String>, exclude: &[String]) -> Result<Self> {
        if include.is_empty() {
            return Err(Error::Config(
                "file_input requires at least one include pattern".to_string(),
            ));
        }
        for pattern in &include {
            Pattern::new(pattern).map_err(|e| {
                Error::InvalidGlob(format!("include pattern '{}': {}", pattern, e))
            })?;
        }

        let exclude = exclude
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|e| {
                    Error::InvalidGlob(format!("exclude pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    /// Paths matching any include pattern minus the excludes, deduplicated,
    /// directories skipped.
    pub fn find(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let Ok(matches) = glob(pattern) else { continue };
            for path in matches.flatten() {
                if path.is_dir() {
                    continue;
                }
                if self.exclude.iter().any(|p| p.matches_path(&path)) {
                    continue;
                }
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        paths
    }
}
