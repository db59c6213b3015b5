//! Tunables of the MD layer

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest number of CPU partitions a handle cookie can encode.
pub const MAX_CPTS: usize = 256;

/// MD layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdConfig {
    /// Number of CPU partitions the MD tables are sharded over
    pub ncpts: usize,
    /// Page-vector length ceiling (waived for `GNILND` MDs)
    pub max_iov: usize,
    /// Largest transfer a free-floating MD may describe, in bytes
    pub mtu: usize,
    /// MDs whose allocation size is at most this many bytes come from the
    /// small-MD pool
    pub small_md_threshold: usize,
    /// Free small-MD slots kept for reuse
    pub small_pool_cache: usize,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            ncpts: 4,
            max_iov: 256,
            mtu: 1 << 20, // 1 MiB
            small_md_threshold: crate::alloc::md_size(1),
            small_pool_cache: 1024,
        }
    }
}

impl MdConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ncpts == 0 || self.ncpts > MAX_CPTS {
            bail!("ncpts must be in 1..={}, got {}", MAX_CPTS, self.ncpts);
        }
        if self.max_iov == 0 {
            bail!("max_iov must be non-zero");
        }
        if self.mtu == 0 {
            bail!("mtu must be non-zero");
        }
        if self.small_md_threshold < crate::alloc::md_size(0) {
            bail!(
                "small_md_threshold {} is smaller than an empty MD ({} bytes)",
                self.small_md_threshold,
                crate::alloc::md_size(0)
            );
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text).context("Failed to parse MD config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MdConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_iov, 256);
        assert_eq!(config.mtu, 1_048_576);
        assert_eq!(config.small_md_threshold, crate::alloc::md_size(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = MdConfig::from_json_str(r#"{ "ncpts": 2, "max_iov": 16 }"#).unwrap();
        assert_eq!(config.ncpts, 2);
        assert_eq!(config.max_iov, 16);
        assert_eq!(config.mtu, MdConfig::default().mtu);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(MdConfig::from_json_str(r#"{ "ncpts": 0 }"#).is_err());
        assert!(MdConfig::from_json_str(r#"{ "ncpts": 257 }"#).is_err());
        assert!(MdConfig::from_json_str(r#"{ "mtu": 0 }"#).is_err());
        assert!(MdConfig::from_json_str(r#"{ "small_md_threshold": 1 }"#).is_err());
        assert!(MdConfig::from_json_str("not json").is_err());
    }
}
