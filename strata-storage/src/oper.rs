//! Single-key mutations applied by the tree walker.
//!
//! A mutation is a [`ModifyOper`]: the walker finds the owning leaf,
//! hands the current value to [`ModifyOper::operate`], and applies the
//! returned [`ModifyOutcome`].
use crate::btree::BTreeValue;
use crate::error::Result;
use crate::large::LargeValue;
use crate::trx::Transaction;
use std::future::Future;

/// Decision of a mutation callback.
pub enum ModifyOutcome {
    /// Keep the leaf as it is.
    Unchanged,
    /// Remove the key.
    Delete,
    /// Insert or replace the entry. A large value must come with the
    /// handle of the object it refers to, an inline value without one.
    Put {
        value: BTreeValue,
        large: Option<LargeValue>,
    },
}

impl ModifyOutcome {
    #[inline]
    pub fn put(value: BTreeValue) -> Self {
        ModifyOutcome::Put { value, large: None }
    }

    #[inline]
    pub fn put_large(value: BTreeValue, large: LargeValue) -> Self {
        ModifyOutcome::Put {
            value,
            large: Some(large),
        }
    }
}

/// Caller supplied mutation of one key.
pub trait ModifyOper {
    /// Compute the new state of the key.
    ///
    /// `old` is None if the key is absent or expired. `old_large` holds
    /// the handle of the current large value object, if any. The callback
    /// may take the handle to update the object in place; an old object
    /// that is not reused by the new value is deleted by the walker.
    fn operate(
        &mut self,
        txn: &Transaction<'_>,
        old: Option<&BTreeValue>,
        old_large: &mut Option<LargeValue>,
    ) -> impl Future<Output = Result<ModifyOutcome>>;

    /// Whether the new value already carries its final CAS tag.
    #[inline]
    fn cas_already_set(&self) -> bool {
        false
    }

    /// Load the current large value before [`operate`](ModifyOper::operate)
    /// runs. Loads everything by default.
    #[inline]
    fn acquire_large_value(
        &mut self,
        txn: &Transaction<'_>,
        lv: &mut LargeValue,
    ) -> impl Future<Output = Result<()>> {
        async move { lv.acquire(txn).await }
    }
}

/// Build a value for given data, storing it out of line if it is
/// longer than the inline bound of the transaction.
async fn make_value(
    txn: &Transaction<'_>,
    data: &[u8],
    exptime: Option<u32>,
) -> Result<ModifyOutcome> {
    let small = if data.len() <= txn.limits().max_inline_value_size {
        BTreeValue::small(data)
    } else {
        None
    };
    let outcome = match small {
        Some(value) => ModifyOutcome::put(value.with_cas_slot().with_exptime(exptime)),
        None => {
            let lv = txn.create_large_value(data).await?;
            let value = BTreeValue::large(lv.root_ref())
                .with_cas_slot()
                .with_exptime(exptime);
            ModifyOutcome::put_large(value, lv)
        }
    };
    Ok(outcome)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Store only if the current CAS tag equals the given one.
    Cas(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResult {
    Stored,
    NotStored,
    /// CAS mismatch.
    Exists,
    /// CAS on an absent key.
    NotFound,
    TooLarge,
}

pub struct SetOper {
    data: Vec<u8>,
    mode: SetMode,
    exptime: Option<u32>,
    cas: Option<u64>,
    result: Option<SetResult>,
}

impl SetOper {
    #[inline]
    pub fn new(data: &[u8], mode: SetMode) -> Self {
        SetOper {
            data: data.to_vec(),
            mode,
            exptime: None,
            cas: None,
            result: None,
        }
    }

    /// Expire the value at given time in seconds since epoch.
    #[inline]
    pub fn exptime(mut self, exptime: u32) -> Self {
        self.exptime = Some(exptime);
        self
    }

    /// Store with caller provided CAS tag instead of a generated one.
    #[inline]
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = Some(cas);
        self
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn result(&self) -> Option<SetResult> {
        self.result
    }
}

impl ModifyOper for SetOper {
    async fn operate(
        &mut self,
        txn: &Transaction<'_>,
        old: Option<&BTreeValue>,
        _old_large: &mut Option<LargeValue>,
    ) -> Result<ModifyOutcome> {
        if self.data.len() > txn.limits().max_value_size {
            self.result = Some(SetResult::TooLarge);
            return Ok(ModifyOutcome::Unchanged);
        }
        let denied = match (self.mode, old) {
            (SetMode::Set, _) => None,
            (SetMode::Add, Some(_)) => Some(SetResult::NotStored),
            (SetMode::Add, None) => None,
            (SetMode::Replace, Some(_)) => None,
            (SetMode::Replace, None) => Some(SetResult::NotStored),
            (SetMode::Cas(_), None) => Some(SetResult::NotFound),
            (SetMode::Cas(expected), Some(v)) => {
                if v.cas() == Some(expected) {
                    None
                } else {
                    Some(SetResult::Exists)
                }
            }
        };
        if let Some(res) = denied {
            self.result = Some(res);
            return Ok(ModifyOutcome::Unchanged);
        }
        let mut outcome = make_value(txn, &self.data, self.exptime).await?;
        if let (Some(cas), ModifyOutcome::Put { value, .. }) = (self.cas, &mut outcome) {
            value.set_cas(cas);
        }
        self.result = Some(SetResult::Stored);
        Ok(outcome)
    }

    #[inline]
    fn cas_already_set(&self) -> bool {
        self.cas.is_some()
    }

    #[inline]
    async fn acquire_large_value(
        &mut self,
        _txn: &Transaction<'_>,
        _lv: &mut LargeValue,
    ) -> Result<()> {
        // old content is never read.
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
}

#[derive(Default)]
pub struct DeleteOper {
    result: Option<DeleteResult>,
}

impl DeleteOper {
    #[inline]
    pub fn new() -> Self {
        DeleteOper::default()
    }

    #[inline]
    pub fn result(&self) -> Option<DeleteResult> {
        self.result
    }
}

impl ModifyOper for DeleteOper {
    async fn operate(
        &mut self,
        _txn: &Transaction<'_>,
        old: Option<&BTreeValue>,
        _old_large: &mut Option<LargeValue>,
    ) -> Result<ModifyOutcome> {
        if old.is_some() {
            self.result = Some(DeleteResult::Deleted);
            Ok(ModifyOutcome::Delete)
        } else {
            self.result = Some(DeleteResult::NotFound);
            Ok(ModifyOutcome::Unchanged)
        }
    }

    #[inline]
    async fn acquire_large_value(
        &mut self,
        _txn: &Transaction<'_>,
        _lv: &mut LargeValue,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrDecrResult {
    Value(u64),
    NotFound,
    NotNumeric,
}

/// Treat the value as a decimal counter.
///
/// Increment wraps around at 64 bits, decrement stops at zero.
pub struct IncrDecrOper {
    incr: bool,
    delta: u64,
    result: Option<IncrDecrResult>,
}

impl IncrDecrOper {
    #[inline]
    pub fn incr(delta: u64) -> Self {
        IncrDecrOper {
            incr: true,
            delta,
            result: None,
        }
    }

    #[inline]
    pub fn decr(delta: u64) -> Self {
        IncrDecrOper {
            incr: false,
            delta,
            result: None,
        }
    }

    #[inline]
    pub fn result(&self) -> Option<IncrDecrResult> {
        self.result
    }
}

impl ModifyOper for IncrDecrOper {
    async fn operate(
        &mut self,
        txn: &Transaction<'_>,
        old: Option<&BTreeValue>,
        _old_large: &mut Option<LargeValue>,
    ) -> Result<ModifyOutcome> {
        let Some(old) = old else {
            self.result = Some(IncrDecrResult::NotFound);
            return Ok(ModifyOutcome::Unchanged);
        };
        let number = old
            .inline_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.trim_end().parse::<u64>().ok());
        let Some(number) = number else {
            self.result = Some(IncrDecrResult::NotNumeric);
            return Ok(ModifyOutcome::Unchanged);
        };
        let number = if self.incr {
            number.wrapping_add(self.delta)
        } else {
            number.saturating_sub(self.delta)
        };
        self.result = Some(IncrDecrResult::Value(number));
        make_value(txn, number.to_string().as_bytes(), old.exptime()).await
    }

    #[inline]
    async fn acquire_large_value(
        &mut self,
        _txn: &Transaction<'_>,
        _lv: &mut LargeValue,
    ) -> Result<()> {
        // large values are never numeric.
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPrependResult {
    Success,
    NotFound,
    TooLarge,
}

/// Concatenate data to an existing value.
///
/// Appending to a large value extends the same object. Prepending, or
/// growing an inline value beyond the inline bound, writes a new object.
pub struct AppendPrependOper {
    data: Vec<u8>,
    append: bool,
    result: Option<AppendPrependResult>,
}

impl AppendPrependOper {
    #[inline]
    pub fn append(data: &[u8]) -> Self {
        AppendPrependOper {
            data: data.to_vec(),
            append: true,
            result: None,
        }
    }

    #[inline]
    pub fn prepend(data: &[u8]) -> Self {
        AppendPrependOper {
            data: data.to_vec(),
            append: false,
            result: None,
        }
    }

    #[inline]
    pub fn result(&self) -> Option<AppendPrependResult> {
        self.result
    }

    #[inline]
    fn concat(&self, old: &[u8]) -> Vec<u8> {
        let mut res = Vec::with_capacity(old.len() + self.data.len());
        if self.append {
            res.extend_from_slice(old);
            res.extend_from_slice(&self.data);
        } else {
            res.extend_from_slice(&self.data);
            res.extend_from_slice(old);
        }
        res
    }
}

impl ModifyOper for AppendPrependOper {
    async fn operate(
        &mut self,
        txn: &Transaction<'_>,
        old: Option<&BTreeValue>,
        old_large: &mut Option<LargeValue>,
    ) -> Result<ModifyOutcome> {
        let Some(old) = old else {
            self.result = Some(AppendPrependResult::NotFound);
            return Ok(ModifyOutcome::Unchanged);
        };
        if old.size() + self.data.len() > txn.limits().max_value_size {
            self.result = Some(AppendPrependResult::TooLarge);
            return Ok(ModifyOutcome::Unchanged);
        }
        self.result = Some(AppendPrependResult::Success);
        if let Some(bytes) = old.inline_bytes() {
            let data = self.concat(bytes);
            return make_value(txn, &data, old.exptime()).await;
        }
        let mut lv = old_large
            .take()
            .unwrap_or_else(|| panic!("large value {:?} without handle", old.lb_ref()));
        let outcome = if self.append {
            lv.append(txn, &self.data).await?;
            let value = BTreeValue::large(lv.root_ref())
                .with_cas_slot()
                .with_exptime(old.exptime());
            ModifyOutcome::put_large(value, lv)
        } else {
            let data = self.concat(lv.data());
            // give the old object back so that it gets deleted.
            *old_large = Some(lv);
            make_value(txn, &data, old.exptime()).await?
        };
        Ok(outcome)
    }
}
