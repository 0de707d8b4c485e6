use crate::btree::key::InlineBytes;
use crate::error::{Error, Result};
use crate::large::LargeRef;

/// Hard upper bound of a value stored inside a leaf.
pub const MAX_IN_NODE_VALUE_SIZE: usize = 250;

/// Largest possible encoded value.
pub const MAX_VALUE_ENCODED_SIZE: usize = value_encoded_size(MAX_IN_NODE_VALUE_SIZE);

const FLAG_CAS: u8 = 0x01;
const FLAG_EXPTIME: u8 = 0x02;
const FLAG_LARGE: u8 = 0x04;

const LARGE_REF_SIZE: usize = 16;

/// Encoded size of a value carrying CAS and expiration with given inline length.
#[inline]
pub const fn value_encoded_size(inline_len: usize) -> usize {
    let payload = if inline_len + 1 > LARGE_REF_SIZE {
        inline_len + 1
    } else {
        LARGE_REF_SIZE
    };
    1 + 8 + 4 + payload
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueData {
    Small(InlineBytes<MAX_IN_NODE_VALUE_SIZE>),
    Large(LargeRef),
}

/// Value of a leaf entry.
///
/// Data is either inline or a reference to a large value object.
/// A value may carry a CAS slot, which is filled with a fresh tag
/// when the value is written, and an expiration time in seconds
/// since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeValue {
    data: ValueData,
    cas: Option<u64>,
    exptime: Option<u32>,
}

impl BTreeValue {
    /// Create an inline value, returns None if data is too long.
    #[inline]
    pub fn small(data: &[u8]) -> Option<Self> {
        InlineBytes::new(data).map(|b| BTreeValue {
            data: ValueData::Small(b),
            cas: None,
            exptime: None,
        })
    }

    /// Create a value referring to a large value object.
    #[inline]
    pub fn large(lb_ref: LargeRef) -> Self {
        BTreeValue {
            data: ValueData::Large(lb_ref),
            cas: None,
            exptime: None,
        }
    }

    /// Reserve a CAS slot, the tag is assigned when the value is written.
    #[inline]
    pub fn with_cas_slot(mut self) -> Self {
        self.cas.get_or_insert(0);
        self
    }

    #[inline]
    pub fn with_exptime(mut self, exptime: Option<u32>) -> Self {
        self.exptime = exptime.filter(|t| *t != 0);
        self
    }

    #[inline]
    pub fn data(&self) -> &ValueData {
        &self.data
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        matches!(self.data, ValueData::Large(_))
    }

    #[inline]
    pub fn lb_ref(&self) -> Option<LargeRef> {
        match self.data {
            ValueData::Large(r) => Some(r),
            ValueData::Small(_) => None,
        }
    }

    /// Returns inline bytes, None for large values.
    #[inline]
    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            ValueData::Small(b) => Some(b.as_bytes()),
            ValueData::Large(_) => None,
        }
    }

    /// Logical size of the value.
    #[inline]
    pub fn size(&self) -> usize {
        match &self.data {
            ValueData::Small(b) => b.len(),
            ValueData::Large(r) => r.size as usize,
        }
    }

    #[inline]
    pub fn has_cas(&self) -> bool {
        self.cas.is_some()
    }

    #[inline]
    pub fn cas(&self) -> Option<u64> {
        self.cas
    }

    #[inline]
    pub fn set_cas(&mut self, cas: u64) {
        debug_assert!(self.has_cas());
        self.cas = Some(cas);
    }

    #[inline]
    pub fn exptime(&self) -> Option<u32> {
        self.exptime
    }

    #[inline]
    pub fn expired(&self, now: u32) -> bool {
        self.exptime.is_some_and(|t| t <= now)
    }

    /// Number of bytes this value occupies in a leaf.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        if self.cas.is_some() {
            len += 8;
        }
        if self.exptime.is_some() {
            len += 4;
        }
        len + match &self.data {
            ValueData::Small(b) => 1 + b.len(),
            ValueData::Large(_) => LARGE_REF_SIZE,
        }
    }

    /// Encode into the beginning of given buffer, returns bytes written.
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut flags = 0u8;
        let mut off = 1;
        if let Some(cas) = self.cas {
            flags |= FLAG_CAS;
            buf[off..off + 8].copy_from_slice(&cas.to_le_bytes());
            off += 8;
        }
        if let Some(exptime) = self.exptime {
            flags |= FLAG_EXPTIME;
            buf[off..off + 4].copy_from_slice(&exptime.to_le_bytes());
            off += 4;
        }
        match &self.data {
            ValueData::Small(b) => {
                buf[off] = b.len() as u8;
                buf[off + 1..off + 1 + b.len()].copy_from_slice(b.as_bytes());
                off += 1 + b.len();
            }
            ValueData::Large(r) => {
                flags |= FLAG_LARGE;
                buf[off..off + 8].copy_from_slice(&r.size.to_le_bytes());
                buf[off + 8..off + 16].copy_from_slice(&r.root.to_le_bytes());
                off += LARGE_REF_SIZE;
            }
        }
        buf[0] = flags;
        off
    }

    /// Decode a value, returns it with number of bytes consumed.
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let flags = *buf.first().ok_or(Error::InvalidFormat)?;
        if flags & !(FLAG_CAS | FLAG_EXPTIME | FLAG_LARGE) != 0 {
            return Err(Error::InvalidFormat);
        }
        let mut off = 1;
        let cas = if flags & FLAG_CAS != 0 {
            let v = u64::from_le_bytes(slice(buf, off, 8)?.try_into()?);
            off += 8;
            Some(v)
        } else {
            None
        };
        let exptime = if flags & FLAG_EXPTIME != 0 {
            let v = u32::from_le_bytes(slice(buf, off, 4)?.try_into()?);
            off += 4;
            Some(v)
        } else {
            None
        };
        let data = if flags & FLAG_LARGE != 0 {
            let size = u64::from_le_bytes(slice(buf, off, 8)?.try_into()?);
            let root = u64::from_le_bytes(slice(buf, off + 8, 8)?.try_into()?);
            off += LARGE_REF_SIZE;
            ValueData::Large(LargeRef { root, size })
        } else {
            let len = *buf.get(off).ok_or(Error::InvalidFormat)? as usize;
            let bytes = slice(buf, off + 1, len)?;
            off += 1 + len;
            ValueData::Small(InlineBytes::new(bytes).ok_or(Error::InvalidFormat)?)
        };
        Ok((BTreeValue { data, cas, exptime }, off))
    }
}

#[inline]
pub(crate) fn slice(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    buf.get(off..off + len).ok_or(Error::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_codec() {
        let mut buf = [0u8; MAX_VALUE_ENCODED_SIZE];
        let v = BTreeValue::small(b"hello")
            .unwrap()
            .with_cas_slot()
            .with_exptime(Some(100));
        let n = v.encode(&mut buf);
        assert_eq!(n, v.encoded_len());
        let (v2, m) = BTreeValue::decode(&buf[..n]).unwrap();
        assert_eq!(m, n);
        assert_eq!(v, v2);
        assert_eq!(v2.cas(), Some(0));
        assert_eq!(v2.inline_bytes(), Some(&b"hello"[..]));

        let l = BTreeValue::large(LargeRef { root: 9, size: 4000 });
        let n = l.encode(&mut buf);
        assert_eq!(n, 17);
        let (l2, _) = BTreeValue::decode(&buf[..n]).unwrap();
        assert!(l2.is_large());
        assert_eq!(l2.lb_ref(), Some(LargeRef { root: 9, size: 4000 }));
        assert_eq!(l2.size(), 4000);
        // truncated input.
        assert!(BTreeValue::decode(&buf[..n - 1]).is_err());
    }

    #[test]
    fn test_value_expiration() {
        let v = BTreeValue::small(b"x").unwrap();
        assert!(!v.expired(u32::MAX));
        // zero means never expire.
        let v = v.with_exptime(Some(0));
        assert_eq!(v.exptime(), None);
        let v = v.with_exptime(Some(50));
        assert!(!v.expired(49));
        assert!(v.expired(50));
        assert!(v.expired(51));
    }

    #[test]
    fn test_value_too_long_for_inline() {
        let data = vec![1u8; MAX_IN_NODE_VALUE_SIZE + 1];
        assert!(BTreeValue::small(&data).is_none());
        assert_eq!(
            value_encoded_size(MAX_IN_NODE_VALUE_SIZE),
            1 + 8 + 4 + 1 + MAX_IN_NODE_VALUE_SIZE
        );
    }
}
