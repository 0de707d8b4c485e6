use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

/// Hard upper bound of key length.
pub const MAX_KEY_SIZE: usize = 250;

/// Bytes stored inline in a fixed-capacity array with explicit length.
///
/// Used for keys and inline values so that copies never allocate.
#[derive(Clone, Copy)]
pub struct InlineBytes<const N: usize> {
    len: u16,
    data: [u8; N],
}

impl<const N: usize> InlineBytes<N> {
    /// Returns empty bytes.
    #[inline]
    pub const fn empty() -> Self {
        InlineBytes {
            len: 0,
            data: [0u8; N],
        }
    }

    /// Copy given bytes, fails if longer than capacity.
    #[inline]
    pub fn new(src: &[u8]) -> Option<Self> {
        if src.len() > N {
            return None;
        }
        let mut res = Self::empty();
        res.data[..src.len()].copy_from_slice(src);
        res.len = src.len() as u16;
        Some(res)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Deref for InlineBytes<N> {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<const N: usize> PartialEq for InlineBytes<N> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<const N: usize> Eq for InlineBytes<N> {}

impl<const N: usize> Hash for InlineBytes<N> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state)
    }
}

impl<const N: usize> fmt::Debug for InlineBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

/// Key of B-tree entries.
///
/// Ordering is lexicographic over bytes, a strict prefix sorts first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BTreeKey(InlineBytes<MAX_KEY_SIZE>);

impl BTreeKey {
    #[inline]
    pub fn new(key: &[u8]) -> Result<Self> {
        InlineBytes::new(key)
            .map(BTreeKey)
            .ok_or(Error::KeyTooLong(key.len()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for BTreeKey {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialOrd for BTreeKey {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BTreeKey {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        sized_cmp(self.as_bytes(), other.as_bytes())
    }
}

impl fmt::Debug for BTreeKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Compare two byte strings by content, then by length.
#[inline]
pub fn sized_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let n = a.len().min(b.len());
    match a[..n].cmp(&b[..n]) {
        Ordering::Equal => a.len().cmp(&b.len()),
        ord => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let k = |s: &str| BTreeKey::new(s.as_bytes()).unwrap();
        assert!(k("a") < k("b"));
        assert!(k("ab") < k("b"));
        assert!(k("a") < k("ab"));
        assert!(k("") < k("a"));
        assert_eq!(k("abc"), k("abc"));
        assert_eq!(sized_cmp(b"abc", b"abd"), Ordering::Less);
        assert_eq!(sized_cmp(b"abcd", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_key_too_long() {
        let long = vec![b'x'; MAX_KEY_SIZE + 1];
        assert!(matches!(BTreeKey::new(&long), Err(Error::KeyTooLong(251))));
        let max = vec![b'x'; MAX_KEY_SIZE];
        assert_eq!(BTreeKey::new(&max).unwrap().len(), MAX_KEY_SIZE);
    }
}
