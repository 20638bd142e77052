//! Pool handles: the names pools are registered and resolved under.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

use crate::error::RspError;
use crate::wire::MAX_POOL_HANDLE_SIZE;

/// An opaque pool name of 1 to [`MAX_POOL_HANDLE_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PoolHandle(Bytes);

impl PoolHandle {
    pub fn new(handle: impl Into<Bytes>) -> Result<Self, RspError> {
        let handle = handle.into();
        if handle.is_empty() {
            return Err(RspError::InvalidValue);
        }
        if handle.len() > MAX_POOL_HANDLE_SIZE {
            return Err(RspError::InvalidPoolHandle);
        }
        Ok(Self(handle))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn is_printable(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ')
    }
}

impl TryFrom<&str> for PoolHandle {
    type Error = RspError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        PoolHandle::new(Bytes::copy_from_slice(name.as_bytes()))
    }
}

impl Ord for PoolHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for PoolHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_printable() {
            f.write_str(&String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "0x{}", hex::encode(&self.0))
        }
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolHandle({self})")
    }
}
