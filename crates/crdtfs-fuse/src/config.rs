//! Mount configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of one crdtfs mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrdtFsConfig {
    /// Mount point.
    pub mountpoint: PathBuf,
    /// Site id of the local replica; must differ between replicas.
    pub site_id: u64,
    /// Seconds the kernel may cache attributes.
    pub attr_ttl_secs: u64,
    /// Seconds the kernel may cache name lookups.
    pub entry_ttl_secs: u64,
    /// Write the demo fixture on init.
    pub seed_demo: bool,
    /// Fixed seed for inode allocation; entropy when unset.
    pub inode_seed: Option<u64>,
    /// Resolve-then-reread rounds per read.
    pub max_resolve_rounds: u32,
    /// Filesystem name shown in the mount table.
    pub fs_name: String,
    /// Let other users access the mount.
    pub allow_other: bool,
}

impl Default for CrdtFsConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/mnt/crdtfs"),
            site_id: 1,
            attr_ttl_secs: 3600,
            entry_ttl_secs: 3600,
            seed_demo: false,
            inode_seed: None,
            max_resolve_rounds: crdtfs_meta::reader::DEFAULT_MAX_ROUNDS,
            fs_name: String::from("crdtfs"),
            allow_other: false,
        }
    }
}

impl CrdtFsConfig {
    /// Loads a `.toml` or `.json` file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Attribute cache lifetime.
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }

    /// Lookup cache lifetime.
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = CrdtFsConfig::default();
        assert_eq!(config.site_id, 1);
        assert_eq!(config.attr_ttl(), Duration::from_secs(3600));
        assert!(!config.seed_demo);
        assert!(config.inode_seed.is_none());
        assert_eq!(config.max_resolve_rounds, 8);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
mountpoint = "/tmp/fs"
site_id = 7
seed_demo = true
inode_seed = 99
"#
        )
        .unwrap();

        let config = CrdtFsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mountpoint, PathBuf::from("/tmp/fs"));
        assert_eq!(config.site_id, 7);
        assert!(config.seed_demo);
        assert_eq!(config.inode_seed, Some(99));
        assert_eq!(config.attr_ttl_secs, 3600);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"site_id": 3, "entry_ttl_secs": 1}}"#).unwrap();

        let config = CrdtFsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.site_id, 3);
        assert_eq!(config.entry_ttl(), Duration::from_secs(1));
        assert_eq!(config.fs_name, "crdtfs");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = CrdtFsConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file extension"));
    }
}
