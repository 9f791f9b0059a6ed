//! Scoped marshalling buffer.
//!
//! A [`MarshalBuffer`] is one contiguous guest allocation that lives exactly as
//! long as the Rust value. Dropping it frees the guest memory, so every exit path
//! of a dispatch (early return, `?`, a failed callback) releases it once.

use super::{FunctionHandle, GuestAddr, GuestMemory};
use crate::error::MemoryError;
use tracing::trace;

/// An owned guest allocation with bounds-checked writes
pub struct MarshalBuffer<'a> {
    arena: &'a mut dyn GuestMemory,
    addr: GuestAddr,
    len: u32,
}

impl<'a> MarshalBuffer<'a> {
    /// Allocate `len` bytes in the guest
    pub fn acquire(arena: &'a mut dyn GuestMemory, len: u32) -> Result<Self, MemoryError> {
        let addr = arena.allocate(len);
        if addr.is_null() {
            return Err(MemoryError::AllocationFailed { len });
        }
        trace!(addr = %addr, len, "Acquired marshalling buffer");
        Ok(Self { arena, addr, len })
    }

    /// Base address of the allocation
    pub fn addr(&self) -> GuestAddr {
        self.addr
    }

    /// Length of the allocation
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the allocation is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `bytes` at `offset` and return the guest address of the field
    pub fn write_at(&mut self, offset: u32, bytes: &[u8]) -> Result<GuestAddr, MemoryError> {
        let out_of_bounds = MemoryError::OutOfBounds {
            addr: self.addr,
            len: self.len,
        };
        let field_len = u32::try_from(bytes.len()).map_err(|_| out_of_bounds.clone())?;
        let end = offset
            .checked_add(field_len)
            .ok_or_else(|| out_of_bounds.clone())?;
        if end > self.len {
            return Err(out_of_bounds);
        }
        let field = self
            .addr
            .checked_add(offset)
            .ok_or_else(|| out_of_bounds.clone())?;
        self.arena.write(field, bytes)?;
        Ok(field)
    }

    /// Call a guest function while the buffer is still live
    pub fn invoke(&mut self, handle: FunctionHandle, argv: &[u32]) -> Result<i32, MemoryError> {
        self.arena.invoke_indirect(handle, argv)
    }
}

impl Drop for MarshalBuffer<'_> {
    fn drop(&mut self) {
        trace!(addr = %self.addr, "Releasing marshalling buffer");
        self.arena.free(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LinearMemory, MemoryEvent};

    #[test]
    fn test_buffer_frees_on_drop() {
        let mut mem = LinearMemory::new(4096);
        let addr = {
            let mut buf = MarshalBuffer::acquire(&mut mem, 8).unwrap();
            buf.write_at(0, b"abc\0").unwrap();
            buf.addr()
        };
        assert_eq!(mem.live_allocations(), 0);
        assert_eq!(mem.free_count(addr), 1);
    }

    #[test]
    fn test_write_at_returns_field_address() {
        let mut mem = LinearMemory::new(4096);
        let mut buf = MarshalBuffer::acquire(&mut mem, 8).unwrap();
        let base = buf.addr();
        let field = buf.write_at(4, &[9, 9]).unwrap();
        assert_eq!(field, GuestAddr(base.0 + 4));
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let mut mem = LinearMemory::new(4096);
        let mut buf = MarshalBuffer::acquire(&mut mem, 4).unwrap();
        assert!(matches!(
            buf.write_at(2, &[1, 2, 3]),
            Err(MemoryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_acquire_failure() {
        let mut mem = LinearMemory::new(4096);
        mem.fail_next_allocations(1);
        let result = MarshalBuffer::acquire(&mut mem, 8);
        assert!(matches!(result, Err(MemoryError::AllocationFailed { len: 8 })));
        drop(result);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_frees_after_failed_invoke() {
        let mut mem = LinearMemory::new(4096);
        {
            let mut buf = MarshalBuffer::acquire(&mut mem, 4).unwrap();
            assert!(buf.invoke(FunctionHandle(77), &[1]).is_err());
        }
        assert_eq!(mem.live_allocations(), 0);
        assert!(matches!(mem.history().last(), Some(MemoryEvent::Free { .. })));
    }
}
