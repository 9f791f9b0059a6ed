//! Guest memory capability consumed by the bridge.
//!
//! The bytecode engine owns the guest's linear memory. The bridge only borrows it
//! through [`GuestMemory`]: allocate, write, free, and call back into the guest
//! through its indirect function table.

pub mod buffer;
pub mod layout;
pub mod linear;

use crate::error::MemoryError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use buffer::MarshalBuffer;
pub use layout::{BlobResultEvp, GuestStruct, ImageProperty, RawData, RectangleRegion};
pub use linear::{GuestFunction, LinearMemory, MemoryEvent};

/// Longest C string the bridge will read out of guest memory
pub const MAX_C_STRING_LEN: u32 = 64 * 1024;

/// An address in guest linear memory
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GuestAddr(pub u32);

impl GuestAddr {
    /// The null guest pointer
    pub const NULL: GuestAddr = GuestAddr(0);

    /// Check for the null pointer
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `offset` bytes further, if it does not wrap
    pub fn checked_add(self, offset: u32) -> Option<GuestAddr> {
        self.0.checked_add(offset).map(GuestAddr)
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for GuestAddr {
    fn from(raw: u32) -> Self {
        GuestAddr(raw)
    }
}

/// Opaque reference to a guest function (an index into its indirect table)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FunctionHandle(pub u32);

impl FunctionHandle {
    /// The unset handle
    pub const NULL: FunctionHandle = FunctionHandle(0);

    /// Check whether the handle is unset
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

impl From<u32> for FunctionHandle {
    fn from(raw: u32) -> Self {
        FunctionHandle(raw)
    }
}

/// Capability interface of the guest memory arena
///
/// Implemented by the engine glue (or by [`LinearMemory`] in tests). The bridge
/// never keeps a reference past the host call it was handed in for.
pub trait GuestMemory {
    /// Allocate `len` bytes inside the guest heap. Returns [`GuestAddr::NULL`] on failure.
    fn allocate(&mut self, len: u32) -> GuestAddr;

    /// Release an allocation obtained from [`GuestMemory::allocate`]
    fn free(&mut self, addr: GuestAddr);

    /// Copy `bytes` into guest memory at `addr`
    fn write(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Copy `len` bytes out of guest memory
    fn read(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>, MemoryError>;

    /// Host view of a guest region, for structures the guest passes by reference
    fn native_region(&mut self, addr: GuestAddr, len: u32) -> Result<&mut [u8], MemoryError>;

    /// Call a guest function through its indirect table with a u32 argument vector
    fn invoke_indirect(&mut self, handle: FunctionHandle, argv: &[u32]) -> Result<i32, MemoryError>;

    /// Read a NUL-terminated string (lossy UTF-8) starting at `addr`
    fn read_c_string(&self, addr: GuestAddr) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        loop {
            if bytes.len() as u32 >= MAX_C_STRING_LEN {
                return Err(MemoryError::OutOfBounds {
                    addr,
                    len: MAX_C_STRING_LEN,
                });
            }
            let byte = self.read(cursor, 1)?[0];
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.checked_add(1).ok_or(MemoryError::OutOfBounds {
                addr,
                len: bytes.len() as u32,
            })?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Encode text the way the guest expects it: UTF-8 followed by one NUL
pub fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

/// Total length of a set of marshalled fields, or `None` if it overflows the guest's address width
pub fn marshalled_len(fields: &[&[u8]]) -> Option<u32> {
    fields.iter().try_fold(0u32, |acc, field| {
        u32::try_from(field.len())
            .ok()
            .and_then(|len| acc.checked_add(len))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles() {
        assert!(GuestAddr::NULL.is_null());
        assert!(FunctionHandle::NULL.is_null());
        assert!(!FunctionHandle(3).is_null());
    }

    #[test]
    fn test_nul_terminated() {
        assert_eq!(nul_terminated("t"), b"t\0".to_vec());
        assert_eq!(nul_terminated(""), vec![0]);
    }

    #[test]
    fn test_marshalled_len() {
        assert_eq!(marshalled_len(&[b"ab\0", &[1, 2, 3]]), Some(6));
        assert_eq!(marshalled_len(&[]), Some(0));
    }

    #[test]
    fn test_read_c_string() {
        let mut mem = LinearMemory::new(4096);
        let addr = mem.allocate(16);
        mem.write(addr, b"hello\0world").unwrap();
        assert_eq!(mem.read_c_string(addr).unwrap(), "hello");
    }

    #[test]
    fn test_display() {
        assert_eq!(GuestAddr(255).to_string(), "0xff");
        assert_eq!(FunctionHandle(4).to_string(), "fn#4");
    }
}
