//! Pool handles, the names pools are registered and resolved under.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{RegistrarError, Result};

/// Maximum length of a pool handle in bytes.
pub const MAX_POOL_HANDLE_SIZE: usize = 32;

/// An opaque pool name.
///
/// Handles order by length first and by content second.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PoolHandle(Vec<u8>);

impl PoolHandle {
    /// Creates a handle from raw bytes, rejecting empty or oversized names.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_POOL_HANDLE_SIZE {
            return Err(RegistrarError::InvalidPoolHandle);
        }
        Ok(PoolHandle(bytes))
    }

    /// Creates a handle without validating its length.
    ///
    /// Used for handle table cursors, which may start from the empty handle.
    pub fn new_unchecked(bytes: impl Into<Vec<u8>>) -> Self {
        PoolHandle(bytes.into())
    }

    /// Returns the raw bytes of the handle.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for the empty handle.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if the handle may be registered under.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_POOL_HANDLE_SIZE
    }
}

impl Ord for PoolHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PoolHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<&str> for PoolHandle {
    type Error = RegistrarError;

    fn try_from(value: &str) -> Result<Self> {
        PoolHandle::new(value.as_bytes())
    }
}

impl TryFrom<&[u8]> for PoolHandle {
    type Error = RegistrarError;

    fn try_from(value: &[u8]) -> Result<Self> {
        PoolHandle::new(value)
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            if byte.is_ascii_control() || byte >= 0x80 {
                write!(f, "{{{byte:02x}}}")?;
            } else {
                write!(f, "{}", byte as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolHandle(\"{self}\")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_lengths() {
        assert_eq!(PoolHandle::new(Vec::new()), Err(RegistrarError::InvalidPoolHandle));
        assert_eq!(
            PoolHandle::new(vec![b'x'; MAX_POOL_HANDLE_SIZE + 1]),
            Err(RegistrarError::InvalidPoolHandle)
        );
        assert!(PoolHandle::new(vec![b'x'; MAX_POOL_HANDLE_SIZE]).is_ok());
        assert!(!PoolHandle::new_unchecked("").is_valid());
    }

    #[test]
    fn orders_by_length_then_content() {
        let short = PoolHandle::try_from("zz").unwrap();
        let long = PoolHandle::try_from("aaa").unwrap();
        let other = PoolHandle::try_from("zy").unwrap();
        assert!(short < long);
        assert!(other < short);
    }

    #[test]
    fn display_escapes_control_bytes() {
        let handle = PoolHandle::new(b"Echo\x01Pool".to_vec()).unwrap();
        assert_eq!(handle.to_string(), "Echo{01}Pool");
        assert_eq!(format!("{handle:?}"), "PoolHandle(\"Echo{01}Pool\")");
    }
}
