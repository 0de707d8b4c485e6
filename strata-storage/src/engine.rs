//! Storage engine of strata.
//!
//! The engine owns a fixed number of slices. Each key belongs to exactly
//! one slice, chosen by the CRC32 of the key, so slices never share data
//! and run fully in parallel.
use crate::btree::{GetValue, TreeStats};
use crate::conf::EngineConfig;
use crate::error::Result;
use crate::oper::{DeleteResult, ModifyOper, SetOper, SetResult};
use crate::slice::Slice;

pub struct Engine {
    slices: Vec<Slice>,
}

impl Engine {
    /// Open all slices of the engine. Slice files are created in main
    /// directory if they do not exist.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.slice.validate()?;
        if let Some(dir) = &config.main_dir {
            std::fs::create_dir_all(dir)?;
        }
        let mut slices = Vec::with_capacity(config.slices);
        for idx in 0..config.slices {
            slices.push(Slice::open(config.slice_config(idx))?);
        }
        log::info!("engine opened with {} slices", slices.len());
        Ok(Engine { slices })
    }

    #[inline]
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    #[inline]
    pub fn slice_idx(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.slices.len()
    }

    #[inline]
    pub fn slice_of(&self, key: &[u8]) -> &Slice {
        &self.slices[self.slice_idx(key)]
    }

    #[inline]
    pub async fn modify<O>(&self, key: &[u8], oper: O) -> Result<O>
    where
        O: ModifyOper + Send + 'static,
    {
        self.slice_of(key).modify(key, oper).await
    }

    #[inline]
    pub async fn get(&self, key: &[u8]) -> Result<Option<GetValue>> {
        self.slice_of(key).get(key).await
    }

    #[inline]
    pub async fn set(&self, key: &[u8], data: &[u8]) -> Result<SetResult> {
        self.slice_of(key).set(key, data).await
    }

    #[inline]
    pub async fn store(&self, key: &[u8], oper: SetOper) -> Result<SetResult> {
        self.slice_of(key).store(key, oper).await
    }

    #[inline]
    pub async fn delete(&self, key: &[u8]) -> Result<DeleteResult> {
        self.slice_of(key).delete(key).await
    }

    /// Verify every slice, returning statistics in slice order.
    pub async fn verify(&self) -> Result<Vec<TreeStats>> {
        let mut res = Vec::with_capacity(self.slices.len());
        for slice in &self.slices {
            res.push(slice.verify().await?);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::SliceConfig;

    #[test]
    fn test_engine_routing() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default()
            .slices(3)
            .main_dir(dir.path().join("data"))
            .slice(
                SliceConfig::default()
                    .block_size(1024u64)
                    .max_key_size(32)
                    .max_inline_value_size(64),
            );
        let engine = config.clone().build().unwrap();
        smol::block_on(async {
            for i in 0..300u32 {
                let key = format!("user:{}", i);
                assert_eq!(
                    engine.set(key.as_bytes(), key.as_bytes()).await.unwrap(),
                    SetResult::Stored
                );
            }
            let stats = engine.verify().await.unwrap();
            assert_eq!(stats.len(), 3);
            assert_eq!(stats.iter().map(|s| s.entries).sum::<usize>(), 300);
            assert!(stats.iter().all(|s| s.entries > 0));
            assert_eq!(engine.delete(b"user:7").await.unwrap(), DeleteResult::Deleted);
        });
        drop(engine);
        for idx in 0..3 {
            assert!(dir.path().join(format!("data/slice.{}.db", idx)).exists());
        }

        let engine = config.build().unwrap();
        smol::block_on(async {
            for i in 0..300u32 {
                let key = format!("user:{}", i);
                let res = engine.get(key.as_bytes()).await.unwrap();
                if i == 7 {
                    assert!(res.is_none());
                } else {
                    assert_eq!(res.unwrap().data, key.as_bytes());
                }
            }
        });
    }
}
