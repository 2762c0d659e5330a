//! Rule persistence
//!
//! Rules live in a JSON array. Saves write a sibling temp file and rename
//! it over the target so a crash never leaves a truncated rule file.

use crate::{PolicyError, Result, Rule};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// JSON rule file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and parse the whole file
    pub fn load(&self) -> Result<Vec<Rule>> {
        let content = fs::read_to_string(&self.path).map_err(|source| PolicyError::Io {
            path: self.path.clone(),
            source,
        })?;

        let rules: Vec<Rule> = serde_json::from_str(&content).map_err(|source| PolicyError::Parse {
            path: self.path.clone(),
            source,
        })?;

        info!(rules = rules.len(), path = %self.path.display(), "Loaded rules");
        Ok(rules)
    }

    /// Rewrite the whole file
    pub fn save(&self, rules: &[Rule]) -> Result<()> {
        let json = serde_json::to_string_pretty(rules).map_err(PolicyError::Encode)?;
        let io_err = |source: std::io::Error| PolicyError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        debug!(rules = rules.len(), path = %self.path.display(), "Saved rules");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "rules.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_common::{Action, Protocol};

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path().join("nested/rules.json"));

        let rules = vec![
            Rule::new(Action::Block).with_dst_port(22).with_protocol(Protocol::Tcp),
            Rule::new(Action::Allow).with_src_ip("192.168.0.0/16".parse().unwrap()),
            Rule::new(Action::Block),
        ];
        store.save(&rules).unwrap();

        assert_eq!(store.load().unwrap(), rules);
        assert!(!dir.path().join("nested/rules.json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path().join("absent.json"));
        match store.load() {
            Err(PolicyError::Io { path, .. }) => assert!(path.ends_with("absent.json")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(RuleStore::new(&path).load(), Err(PolicyError::Parse { .. })));
    }
}
