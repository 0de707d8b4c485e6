use crate::block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::btree::{NodeLimits, MAX_IN_NODE_VALUE_SIZE, MAX_KEY_SIZE};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::slice::Slice;
use crate::trx::SizeLimits;
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BLOCK_SIZE: Byte = Byte::from_u64(4096);
pub const DEFAULT_MAX_VALUE_SIZE: Byte = Byte::from_u64(1024 * 1024);
pub const DEFAULT_WORKER_NAME: &str = "Slice-Worker";
pub const DEFAULT_SLICES: usize = 4;
pub const DEFAULT_SLICE_FILE_PREFIX: &str = "slice";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    // Size of every block of the slice file. Cannot change after the
    // file is created.
    pub block_size: Byte,
    pub max_key_size: usize,
    // Values longer than this are stored in large value blocks.
    pub max_inline_value_size: usize,
    pub max_value_size: Byte,
    // Slice file, in memory if not set.
    pub data_file: Option<PathBuf>,
    pub worker_name: String,
}

impl Default for SliceConfig {
    #[inline]
    fn default() -> Self {
        SliceConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            max_key_size: MAX_KEY_SIZE,
            max_inline_value_size: MAX_IN_NODE_VALUE_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            data_file: None,
            worker_name: String::from(DEFAULT_WORKER_NAME),
        }
    }
}

impl SliceConfig {
    #[inline]
    pub fn block_size<T>(mut self, block_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.block_size = Byte::from(block_size);
        self
    }

    #[inline]
    pub fn max_key_size(mut self, max_key_size: usize) -> Self {
        self.max_key_size = max_key_size;
        self
    }

    #[inline]
    pub fn max_inline_value_size(mut self, max_inline_value_size: usize) -> Self {
        self.max_inline_value_size = max_inline_value_size;
        self
    }

    #[inline]
    pub fn max_value_size<T>(mut self, max_value_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.max_value_size = Byte::from(max_value_size);
        self
    }

    #[inline]
    pub fn data_file(mut self, data_file: impl AsRef<Path>) -> Self {
        self.data_file = Some(data_file.as_ref().to_path_buf());
        self
    }

    #[inline]
    pub fn worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = worker_name.into();
        self
    }

    #[inline]
    pub fn block_size_bytes(&self) -> usize {
        self.block_size.as_u64() as usize
    }

    #[inline]
    pub fn limits(&self) -> SizeLimits {
        SizeLimits {
            max_key_size: self.max_key_size,
            max_inline_value_size: self.max_inline_value_size,
            max_value_size: self.max_value_size.as_u64() as usize,
        }
    }

    /// Parse config from TOML text. Absent fields take defaults.
    #[inline]
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: SliceConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the largest entries leave room for splitting, merging
    /// and leveling nodes within one block.
    pub fn validate(&self) -> Result<()> {
        let block_size = self.block_size_bytes();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(Error::InvalidConfig(format!(
                "block size {} out of range [{}, {}]",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max key size {} out of range [1, {}]",
                self.max_key_size, MAX_KEY_SIZE
            )));
        }
        if self.max_inline_value_size > MAX_IN_NODE_VALUE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max inline value size {} exceeds {}",
                self.max_inline_value_size, MAX_IN_NODE_VALUE_SIZE
            )));
        }
        if (self.max_value_size.as_u64() as usize) < self.max_inline_value_size {
            return Err(Error::InvalidConfig(String::from(
                "max value size smaller than max inline value size",
            )));
        }
        let limits = NodeLimits::new(block_size, self.max_key_size);
        let bound = limits.capacity() / 6;
        let leaf_entry = limits.max_leaf_entry(self.max_inline_value_size);
        if leaf_entry > bound || limits.max_internal_entry() > bound {
            return Err(Error::InvalidConfig(format!(
                "block size {} too small for entries of {} bytes",
                block_size,
                leaf_entry.max(limits.max_internal_entry())
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn build(self) -> Result<Slice> {
        Slice::open(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub slices: usize,
    // Directory of slice files, in memory if not set.
    // File of each slice is named as <prefix>.<slice_idx>.db
    pub main_dir: Option<PathBuf>,
    pub slice_file_prefix: String,
    pub slice: SliceConfig,
}

impl Default for EngineConfig {
    #[inline]
    fn default() -> Self {
        EngineConfig {
            slices: DEFAULT_SLICES,
            main_dir: None,
            slice_file_prefix: String::from(DEFAULT_SLICE_FILE_PREFIX),
            slice: SliceConfig::default(),
        }
    }
}

impl EngineConfig {
    #[inline]
    pub fn slices(mut self, slices: usize) -> Self {
        assert!(slices > 0);
        self.slices = slices;
        self
    }

    #[inline]
    pub fn main_dir(mut self, main_dir: impl AsRef<Path>) -> Self {
        self.main_dir = Some(main_dir.as_ref().to_path_buf());
        self
    }

    #[inline]
    pub fn slice(mut self, slice: SliceConfig) -> Self {
        self.slice = slice;
        self
    }

    #[inline]
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        if config.slices == 0 {
            return Err(Error::InvalidConfig(String::from("no slices")));
        }
        config.slice.validate()?;
        Ok(config)
    }

    /// Config of the slice with given index.
    #[inline]
    pub fn slice_config(&self, idx: usize) -> SliceConfig {
        let mut config = self.slice.clone();
        config.worker_name = format!("{}-{}", self.slice.worker_name, idx);
        if let Some(dir) = &self.main_dir {
            config.data_file = Some(dir.join(format!("{}.{}.db", self.slice_file_prefix, idx)));
        }
        config
    }

    #[inline]
    pub fn build(self) -> Result<Engine> {
        Engine::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_config() {
        let config = SliceConfig::default();
        println!("{:?}", config);
        config.validate().unwrap();
        let config_str = toml::to_string(&config).unwrap();
        println!("{}", config_str);

        // default entries do not fit in small blocks.
        let config = SliceConfig::default().block_size(1024u64);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        let config = SliceConfig::default()
            .block_size(512u64)
            .max_key_size(16)
            .max_inline_value_size(32);
        config.validate().unwrap();
        assert_eq!(config.limits().max_key_size, 16);
        let config = SliceConfig::default().block_size(128u64 * 1024);
        assert!(config.validate().is_err());
        let config = SliceConfig::default().max_key_size(251);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config = SliceConfig::from_toml(
            r#"
            block_size = 8192
            max_key_size = 64
            worker_name = "Tree"
            "#,
        )
        .unwrap();
        assert_eq!(config.block_size_bytes(), 8192);
        assert_eq!(config.max_key_size, 64);
        assert_eq!(config.max_inline_value_size, MAX_IN_NODE_VALUE_SIZE);
        assert!(SliceConfig::from_toml("block_size = 100").is_err());
        assert!(SliceConfig::from_toml("max_key_size = \"x\"").is_err());

        let config = EngineConfig::from_toml(
            r#"
            slices = 2
            main_dir = "/tmp/strata"

            [slice]
            block_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.slices, 2);
        let sc = config.slice_config(1);
        assert_eq!(sc.data_file, Some(PathBuf::from("/tmp/strata/slice.1.db")));
        assert_eq!(sc.worker_name, "Slice-Worker-1");
    }
}
