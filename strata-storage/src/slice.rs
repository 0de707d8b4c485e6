//! One B-tree bound to one worker thread.
//!
//! All operations of a slice run as jobs on the slice's local executor.
//! Jobs interleave only at lock waits, and every job runs inside its own
//! transaction. A job that fails or panics leaves the in-memory blocks
//! out of sync with the device, so the slice is poisoned and refuses any
//! further work.
use crate::block::{BlockCache, BlockDevice, FileDevice, MemDevice};
use crate::btree::{self, BTreeKey, GetValue, TreeContext, TreeStats};
use crate::clock::{CasGenerator, Clock, SystemClock};
use crate::conf::SliceConfig;
use crate::error::{Error, Result};
use crate::metrics::{DepthGauge, BTREE_DEPTH};
use crate::oper::{
    AppendPrependOper, AppendPrependResult, DeleteOper, DeleteResult, IncrDecrOper,
    IncrDecrResult, ModifyOper, SetMode, SetOper, SetResult,
};
use crate::thread;
use crate::trx::{SizeLimits, Transaction, TrxMode};
use async_executor::LocalExecutor;
use flume::{Receiver, Sender};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce(Arc<SliceCore>) -> LocalBoxFuture<'static, ()> + Send>;

/// State shared between the slice handle and its worker.
pub struct SliceCore {
    cache: BlockCache,
    limits: SizeLimits,
    clock: Arc<dyn Clock>,
    cas: CasGenerator,
    depth: &'static DepthGauge,
    poisoned: AtomicBool,
}

impl SliceCore {
    #[inline]
    pub fn limits(&self) -> &SizeLimits {
        &self.limits
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    #[inline]
    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    #[inline]
    fn tree_context(&self) -> TreeContext<'_> {
        TreeContext {
            clock: &*self.clock,
            cas: &self.cas,
            depth: self.depth,
        }
    }

    /// Apply a mutation in a new write transaction.
    pub async fn modify<O: ModifyOper>(&self, key: &BTreeKey, oper: &mut O) -> Result<()> {
        let txn = Transaction::begin(&self.cache, TrxMode::Write, self.limits);
        let ctx = self.tree_context();
        let res = btree::modify(&txn, &ctx, key, oper).await;
        match res {
            Ok(()) => {
                let res = txn.commit();
                if res.is_err() {
                    self.poison();
                }
                res
            }
            Err(e) => {
                txn.abort();
                self.poison();
                log::error!("slice poisoned by failed mutation: {}", e);
                Err(e)
            }
        }
    }

    pub async fn get(&self, key: &BTreeKey) -> Result<Option<GetValue>> {
        let txn = Transaction::begin(&self.cache, TrxMode::Read, self.limits);
        btree::get(&txn, &*self.clock, key).await
    }

    pub async fn verify(&self) -> Result<TreeStats> {
        let txn = Transaction::begin(&self.cache, TrxMode::Read, self.limits);
        btree::verify(&txn).await
    }

    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.cache.free_blocks()
    }
}

/// Handle of a slice. Dropping it stops the worker after the jobs
/// already submitted are done.
pub struct Slice {
    core: Arc<SliceCore>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Slice {
    /// Open slice with system clock, reporting depth to the process-wide
    /// gauge.
    #[inline]
    pub fn open(config: SliceConfig) -> Result<Self> {
        Self::open_with(config, Arc::new(SystemClock), &BTREE_DEPTH)
    }

    pub fn open_with(
        config: SliceConfig,
        clock: Arc<dyn Clock>,
        depth: &'static DepthGauge,
    ) -> Result<Self> {
        config.validate()?;
        let block_size = config.block_size_bytes();
        let device: Box<dyn BlockDevice> = match &config.data_file {
            Some(path) => Box::new(FileDevice::open(path, block_size)?),
            None => Box::new(MemDevice::new(block_size)),
        };
        let cache = BlockCache::open(device)?;
        let cas = CasGenerator::new(&*clock);
        let core = Arc::new(SliceCore {
            cache,
            limits: config.limits(),
            clock,
            cas,
            depth,
            poisoned: AtomicBool::new(false),
        });
        let tree_depth = smol::block_on(async {
            let txn = Transaction::begin(&core.cache, TrxMode::Read, core.limits);
            btree::depth(&txn).await
        })?;
        depth.add(tree_depth as i64);
        log::info!(
            "slice opened: worker={}, file={:?}, block_size={}, depth={}",
            config.worker_name,
            config.data_file,
            block_size,
            tree_depth
        );
        let (tx, rx) = flume::unbounded();
        let worker = {
            let core = Arc::clone(&core);
            thread::spawn_named(config.worker_name, move || run_worker(core, rx))?
        };
        Ok(Slice {
            core,
            jobs: Some(tx),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn core(&self) -> &SliceCore {
        &self.core
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.core.is_poisoned()
    }

    /// Run a job on the worker and wait for its result.
    pub async fn submit<T, F, Fut>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<SliceCore>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        if self.core.is_poisoned() {
            return Err(Error::SlicePoisoned);
        }
        let (tx, rx) = flume::bounded(1);
        let job: Job = Box::new(move |core: Arc<SliceCore>| {
            async move {
                if core.is_poisoned() {
                    let _ = tx.send(Err(Error::SlicePoisoned));
                    return;
                }
                let res = f(core).await;
                let _ = tx.send(res);
            }
            .boxed_local()
        });
        let jobs = self.jobs.as_ref().ok_or(Error::SliceShutdown)?;
        jobs.send(job).map_err(|_| Error::SliceShutdown)?;
        // reply is dropped without sending only if the job panicked.
        rx.recv_async().await.map_err(|_| {
            self.core.poison();
            Error::SlicePoisoned
        })?
    }

    #[inline]
    fn check_key(&self, key: &[u8]) -> Result<BTreeKey> {
        if key.len() > self.core.limits.max_key_size {
            return Err(Error::KeyTooLong(key.len()));
        }
        BTreeKey::new(key)
    }

    /// Apply a mutation to given key. The operation is returned so that
    /// the caller can inspect its result.
    pub async fn modify<O>(&self, key: &[u8], oper: O) -> Result<O>
    where
        O: ModifyOper + Send + 'static,
    {
        let key = self.check_key(key)?;
        self.submit(move |core| async move {
            let mut oper = oper;
            core.modify(&key, &mut oper).await?;
            Ok(oper)
        })
        .await
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<GetValue>> {
        let key = self.check_key(key)?;
        self.submit(move |core| async move { core.get(&key).await })
            .await
    }

    pub async fn verify(&self) -> Result<TreeStats> {
        self.submit(|core| async move { core.verify().await }).await
    }

    #[inline]
    pub async fn set(&self, key: &[u8], data: &[u8]) -> Result<SetResult> {
        self.store(key, SetOper::new(data, SetMode::Set)).await
    }

    /// Store with given condition and options.
    pub async fn store(&self, key: &[u8], oper: SetOper) -> Result<SetResult> {
        if oper.data_len() > self.core.limits.max_value_size {
            return Err(Error::ValueTooLarge(oper.data_len()));
        }
        let oper = self.modify(key, oper).await?;
        oper.result().ok_or(Error::InvalidArgument)
    }

    pub async fn delete(&self, key: &[u8]) -> Result<DeleteResult> {
        let oper = self.modify(key, DeleteOper::new()).await?;
        oper.result().ok_or(Error::InvalidArgument)
    }

    pub async fn incr(&self, key: &[u8], delta: u64) -> Result<IncrDecrResult> {
        let oper = self.modify(key, IncrDecrOper::incr(delta)).await?;
        oper.result().ok_or(Error::InvalidArgument)
    }

    pub async fn decr(&self, key: &[u8], delta: u64) -> Result<IncrDecrResult> {
        let oper = self.modify(key, IncrDecrOper::decr(delta)).await?;
        oper.result().ok_or(Error::InvalidArgument)
    }

    pub async fn append(&self, key: &[u8], data: &[u8]) -> Result<AppendPrependResult> {
        let oper = self.modify(key, AppendPrependOper::append(data)).await?;
        oper.result().ok_or(Error::InvalidArgument)
    }

    pub async fn prepend(&self, key: &[u8], data: &[u8]) -> Result<AppendPrependResult> {
        let oper = self.modify(key, AppendPrependOper::prepend(data)).await?;
        oper.result().ok_or(Error::InvalidArgument)
    }
}

impl Drop for Slice {
    #[inline]
    fn drop(&mut self) {
        // closing the channel stops the dispatch loop.
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(core: Arc<SliceCore>, rx: Receiver<Job>) {
    let ex: Rc<LocalExecutor<'static>> = Rc::new(LocalExecutor::new());
    smol::block_on(ex.run(dispatch(Rc::clone(&ex), core, rx)));
}

async fn dispatch(ex: Rc<LocalExecutor<'static>>, core: Arc<SliceCore>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv_async().await {
        let fut = job(Arc::clone(&core));
        let core = Arc::clone(&core);
        ex.spawn(async move {
            // unwinding drops the locks and aborts the transaction of the job.
            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                core.poison();
                log::error!("slice job panicked, slice poisoned");
            }
        })
        .detach();
    }
    while !ex.is_empty() {
        ex.tick().await;
    }
    log::info!("slice worker exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::btree::BTreeValue;
    use crate::large::LargeValue;
    use crate::oper::ModifyOutcome;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;

    fn small_config() -> SliceConfig {
        SliceConfig::default()
            .block_size(512u64)
            .max_key_size(16)
            .max_inline_value_size(32)
            .max_value_size(8192u64)
    }

    fn open(config: SliceConfig, clock: Arc<ManualClock>) -> Slice {
        let _ = env_logger::builder().is_test(true).try_init();
        let gauge: &'static DepthGauge = Box::leak(Box::new(DepthGauge::new()));
        Slice::open_with(config, clock, gauge).unwrap()
    }

    struct FailOper(bool);

    impl ModifyOper for FailOper {
        async fn operate(
            &mut self,
            _txn: &Transaction<'_>,
            _old: Option<&BTreeValue>,
            _old_large: &mut Option<LargeValue>,
        ) -> Result<ModifyOutcome> {
            if self.0 {
                panic!("mutation failed");
            }
            Err(Error::InvalidArgument)
        }
    }

    #[test]
    fn test_slice_set_get_delete() {
        smol::block_on(async {
            let slice = open(small_config(), Arc::new(ManualClock::new(1000)));
            assert_eq!(slice.get(b"k1").await.unwrap(), None);
            assert_eq!(slice.set(b"k1", b"v1").await.unwrap(), SetResult::Stored);
            let v = slice.get(b"k1").await.unwrap().unwrap();
            assert_eq!(v.data, b"v1");
            assert!(v.cas.is_some());
            let res = slice
                .store(b"k1", SetOper::new(b"v2", SetMode::Add))
                .await
                .unwrap();
            assert_eq!(res, SetResult::NotStored);
            let res = slice
                .store(b"k2", SetOper::new(b"v2", SetMode::Replace))
                .await
                .unwrap();
            assert_eq!(res, SetResult::NotStored);
            let res = slice
                .store(b"k1", SetOper::new(b"v3", SetMode::Cas(v.cas.unwrap())))
                .await
                .unwrap();
            assert_eq!(res, SetResult::Stored);
            let res = slice
                .store(b"k1", SetOper::new(b"v4", SetMode::Cas(v.cas.unwrap())))
                .await
                .unwrap();
            assert_eq!(res, SetResult::Exists);
            assert_eq!(slice.get(b"k1").await.unwrap().unwrap().data, b"v3");
            assert_eq!(slice.delete(b"k1").await.unwrap(), DeleteResult::Deleted);
            assert_eq!(slice.delete(b"k1").await.unwrap(), DeleteResult::NotFound);
            assert_eq!(slice.verify().await.unwrap().entries, 0);
        })
    }

    #[test]
    fn test_slice_limits() {
        smol::block_on(async {
            let slice = open(small_config(), Arc::new(ManualClock::new(1000)));
            let res = slice.set(&[b'k'; 17], b"v").await;
            assert!(matches!(res, Err(Error::KeyTooLong(17))));
            let res = slice.set(b"k", &vec![0u8; 8193]).await;
            assert!(matches!(res, Err(Error::ValueTooLarge(8193))));
            assert_eq!(slice.set(b"k", &vec![1u8; 8192]).await.unwrap(), SetResult::Stored);
            let res = slice.append(b"k", b"x").await.unwrap();
            assert_eq!(res, AppendPrependResult::TooLarge);
            assert!(!slice.is_poisoned());
        })
    }

    #[test]
    fn test_slice_counters_and_concat() {
        smol::block_on(async {
            let slice = open(small_config(), Arc::new(ManualClock::new(1000)));
            assert_eq!(slice.incr(b"n", 1).await.unwrap(), IncrDecrResult::NotFound);
            slice.set(b"n", b"10").await.unwrap();
            assert_eq!(slice.incr(b"n", 5).await.unwrap(), IncrDecrResult::Value(15));
            assert_eq!(slice.decr(b"n", 20).await.unwrap(), IncrDecrResult::Value(0));
            slice.set(b"s", b"abc").await.unwrap();
            assert_eq!(slice.incr(b"s", 1).await.unwrap(), IncrDecrResult::NotNumeric);
            assert_eq!(slice.append(b"s", b"def").await.unwrap(), AppendPrependResult::Success);
            assert_eq!(slice.prepend(b"s", b"_").await.unwrap(), AppendPrependResult::Success);
            assert_eq!(slice.get(b"s").await.unwrap().unwrap().data, b"_abcdef");
            assert_eq!(slice.append(b"x", b"1").await.unwrap(), AppendPrependResult::NotFound);
        })
    }

    #[test]
    fn test_slice_expiration() {
        smol::block_on(async {
            let clock = Arc::new(ManualClock::new(1000));
            let slice = open(small_config(), Arc::clone(&clock));
            let res = slice
                .store(b"t", SetOper::new(b"v", SetMode::Set).exptime(1010))
                .await
                .unwrap();
            assert_eq!(res, SetResult::Stored);
            assert_eq!(slice.get(b"t").await.unwrap().unwrap().exptime, Some(1010));
            clock.set(1010);
            assert_eq!(slice.get(b"t").await.unwrap(), None);
            // expired key counts as absent for add.
            let res = slice
                .store(b"t", SetOper::new(b"w", SetMode::Add))
                .await
                .unwrap();
            assert_eq!(res, SetResult::Stored);
            assert_eq!(slice.get(b"t").await.unwrap().unwrap().data, b"w");
        })
    }

    #[test]
    fn test_slice_poisoned_by_error() {
        smol::block_on(async {
            let slice = open(small_config(), Arc::new(ManualClock::new(1000)));
            slice.set(b"a", b"1").await.unwrap();
            let res = slice.modify(b"a", FailOper(false)).await;
            assert!(matches!(res, Err(Error::InvalidArgument)));
            assert!(slice.is_poisoned());
            let res = slice.get(b"a").await;
            assert!(matches!(res, Err(Error::SlicePoisoned)));
        })
    }

    #[test]
    fn test_slice_poisoned_by_panic() {
        smol::block_on(async {
            let slice = open(small_config(), Arc::new(ManualClock::new(1000)));
            slice.set(b"a", b"1").await.unwrap();
            let res = slice.modify(b"a", FailOper(true)).await;
            assert!(matches!(res, Err(Error::SlicePoisoned)));
            assert!(slice.is_poisoned());
            let res = slice.set(b"b", b"2").await;
            assert!(matches!(res, Err(Error::SlicePoisoned)));
        })
    }

    #[test]
    fn test_slice_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.db");
        let clock = Arc::new(ManualClock::new(1000));
        let gauge: &'static DepthGauge = Box::leak(Box::new(DepthGauge::new()));
        let mut model = BTreeMap::new();
        let stats = {
            let slice = Slice::open_with(
                small_config().data_file(&path),
                clock.clone(),
                gauge,
            )
            .unwrap();
            smol::block_on(async {
                for i in 0..200u32 {
                    let key = format!("key{:05}", i);
                    let value = if i % 17 == 0 {
                        vec![b'L'; 300 + i as usize]
                    } else {
                        format!("value{}", i).into_bytes()
                    };
                    slice.set(key.as_bytes(), &value).await.unwrap();
                    model.insert(key, value);
                }
                for i in (0..200u32).step_by(3) {
                    let key = format!("key{:05}", i);
                    slice.delete(key.as_bytes()).await.unwrap();
                    model.remove(&key);
                }
                slice.verify().await.unwrap()
            })
        };
        assert!(stats.depth >= 2);
        assert_eq!(gauge.get(), stats.depth as i64);

        let slice = Slice::open_with(small_config().data_file(&path), clock, gauge).unwrap();
        assert_eq!(gauge.get(), 2 * stats.depth as i64);
        smol::block_on(async {
            assert_eq!(slice.verify().await.unwrap(), stats);
            for (k, v) in &model {
                let res = slice.get(k.as_bytes()).await.unwrap().unwrap();
                assert_eq!(&res.data, v);
            }
            assert_eq!(slice.get(b"key00000").await.unwrap(), None);
        });
        drop(slice);

        // block size is fixed at creation.
        let res = Slice::open_with(
            small_config().block_size(1024u64).data_file(&path),
            Arc::new(ManualClock::new(1000)),
            gauge,
        );
        assert!(matches!(res, Err(Error::ConfigMismatch)));
    }

    #[test]
    fn test_slice_concurrent_clients() {
        let slice = Arc::new(open(small_config(), Arc::new(ManualClock::new(1000))));
        let mut handles = vec![];
        for t in 0..4u64 {
            let slice = Arc::clone(&slice);
            handles.push(std::thread::spawn(move || {
                smol::block_on(async {
                    let mut rng = ChaCha8Rng::seed_from_u64(t);
                    for i in 0..100 {
                        let key = format!("t{}k{:03}", t, rng.random_range(0..50u32));
                        if rng.random_bool(0.7) {
                            let value = vec![b'a' + t as u8; rng.random_range(1..=64usize)];
                            slice.set(key.as_bytes(), &value).await.unwrap();
                        } else {
                            slice.delete(key.as_bytes()).await.unwrap();
                        }
                        if i % 25 == 0 {
                            slice.verify().await.unwrap();
                        }
                    }
                })
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        smol::block_on(async {
            let stats = slice.verify().await.unwrap();
            assert!(stats.entries <= 200);
            assert!(!slice.is_poisoned());
        })
    }
}
