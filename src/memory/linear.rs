//! In-process guest memory.
//!
//! [`LinearMemory`] stands in for an engine's module instance: a flat byte array
//! with a first-fit heap, an indirect function table of Rust closures, and a
//! history of every allocation, free and call so tests can check ordering.

use super::{FunctionHandle, GuestAddr, GuestMemory};
use crate::error::MemoryError;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// First address handed out by the heap; lower memory stays unused so 0 is never valid
const HEAP_BASE: u32 = 1024;

/// Heap alignment
const ALIGN: u32 = 8;

/// A guest function: receives the memory it runs in and its argument vector
pub type GuestFunction =
    Box<dyn FnMut(&mut LinearMemory, &[u32]) -> Result<i32, MemoryError> + Send>;

/// One entry of the memory history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    /// Successful allocation
    Alloc {
        /// Address
        addr: GuestAddr,
        /// Requested length
        len: u32,
    },
    /// Allocation refused
    AllocFailed {
        /// Requested length
        len: u32,
    },
    /// Release of a live allocation
    Free {
        /// Address
        addr: GuestAddr,
    },
    /// Release of an address that was not live
    InvalidFree {
        /// Address
        addr: GuestAddr,
    },
    /// Indirect call
    Invoke {
        /// Target
        handle: FunctionHandle,
        /// Arguments
        argv: Vec<u32>,
    },
}

/// Flat guest memory with a simple heap and function table
pub struct LinearMemory {
    bytes: Vec<u8>,
    top: u32,
    live: BTreeMap<u32, u32>,
    free_blocks: BTreeMap<u32, u32>,
    functions: Vec<Option<GuestFunction>>,
    fail_allocations: u32,
    free_counts: HashMap<u32, usize>,
    history: Vec<MemoryEvent>,
}

impl LinearMemory {
    /// Create a memory of `size` bytes
    pub fn new(size: u32) -> Self {
        Self {
            bytes: vec![0; size as usize],
            top: HEAP_BASE,
            live: BTreeMap::new(),
            free_blocks: BTreeMap::new(),
            // slot 0 is the null handle
            functions: vec![None],
            fail_allocations: 0,
            free_counts: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Add a function to the indirect table
    pub fn register_function<F>(&mut self, function: F) -> FunctionHandle
    where
        F: FnMut(&mut LinearMemory, &[u32]) -> Result<i32, MemoryError> + Send + 'static,
    {
        self.functions.push(Some(Box::new(function)));
        FunctionHandle((self.functions.len() - 1) as u32)
    }

    /// Make the next `count` allocations fail
    pub fn fail_next_allocations(&mut self, count: u32) {
        self.fail_allocations = count;
    }

    /// Number of allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Whether `addr` is the start of a live allocation
    pub fn is_live(&self, addr: GuestAddr) -> bool {
        self.live.contains_key(&addr.0)
    }

    /// How many times `addr` was freed while live
    pub fn free_count(&self, addr: GuestAddr) -> usize {
        self.free_counts.get(&addr.0).copied().unwrap_or(0)
    }

    /// Everything that happened to this memory, oldest first
    pub fn history(&self) -> &[MemoryEvent] {
        &self.history
    }

    /// Indirect calls made so far
    pub fn invocations(&self) -> Vec<(FunctionHandle, Vec<u32>)> {
        self.history
            .iter()
            .filter_map(|event| match event {
                MemoryEvent::Invoke { handle, argv } => Some((*handle, argv.clone())),
                _ => None,
            })
            .collect()
    }

    /// Forget the recorded history
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn check_range(&self, addr: GuestAddr, len: u32) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = addr.0 as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MemoryError::OutOfBounds { addr, len })?;
        Ok(start..end)
    }

    fn take_free_block(&mut self, size: u32) -> Option<u32> {
        let (addr, block) = self
            .free_blocks
            .iter()
            .find(|(_, block)| **block >= size)
            .map(|(addr, block)| (*addr, *block))?;
        self.free_blocks.remove(&addr);
        if block > size {
            self.free_blocks.insert(addr + size, block - size);
        }
        Some(addr)
    }

    fn release_block(&mut self, addr: u32, size: u32) {
        let mut start = addr;
        let mut size = size;

        if let Some((&prev, &prev_size)) = self.free_blocks.range(..addr).next_back() {
            if prev + prev_size == addr {
                self.free_blocks.remove(&prev);
                start = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.free_blocks.remove(&(start + size)) {
            size += next_size;
        }

        if start + size == self.top {
            self.top = start;
        } else {
            self.free_blocks.insert(start, size);
        }
    }
}

fn aligned(len: u32) -> Option<u32> {
    len.max(1).checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1))
}

impl GuestMemory for LinearMemory {
    fn allocate(&mut self, len: u32) -> GuestAddr {
        if self.fail_allocations > 0 {
            self.fail_allocations -= 1;
            debug!(len, "Injected allocation failure");
            self.history.push(MemoryEvent::AllocFailed { len });
            return GuestAddr::NULL;
        }

        let Some(size) = aligned(len) else {
            self.history.push(MemoryEvent::AllocFailed { len });
            return GuestAddr::NULL;
        };

        let addr = match self.take_free_block(size) {
            Some(addr) => addr,
            None => {
                let end = self.top.checked_add(size);
                match end {
                    Some(end) if end as usize <= self.bytes.len() => {
                        let addr = self.top;
                        self.top = end;
                        addr
                    }
                    _ => {
                        self.history.push(MemoryEvent::AllocFailed { len });
                        return GuestAddr::NULL;
                    }
                }
            }
        };

        self.live.insert(addr, size);
        self.history.push(MemoryEvent::Alloc {
            addr: GuestAddr(addr),
            len,
        });
        GuestAddr(addr)
    }

    fn free(&mut self, addr: GuestAddr) {
        match self.live.remove(&addr.0) {
            Some(size) => {
                *self.free_counts.entry(addr.0).or_insert(0) += 1;
                self.history.push(MemoryEvent::Free { addr });
                self.release_block(addr.0, size);
            }
            None => {
                warn!(addr = %addr, "Free of an address that is not live");
                self.history.push(MemoryEvent::InvalidFree { addr });
            }
        }
    }

    fn write(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<(), MemoryError> {
        let len = u32::try_from(bytes.len()).map_err(|_| MemoryError::OutOfBounds {
            addr,
            len: u32::MAX,
        })?;
        let range = self.check_range(addr, len)?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>, MemoryError> {
        let range = self.check_range(addr, len)?;
        Ok(self.bytes[range].to_vec())
    }

    fn native_region(&mut self, addr: GuestAddr, len: u32) -> Result<&mut [u8], MemoryError> {
        if addr.is_null() {
            return Err(MemoryError::OutOfBounds { addr, len });
        }
        let range = self.check_range(addr, len)?;
        Ok(&mut self.bytes[range])
    }

    fn invoke_indirect(&mut self, handle: FunctionHandle, argv: &[u32]) -> Result<i32, MemoryError> {
        self.history.push(MemoryEvent::Invoke {
            handle,
            argv: argv.to_vec(),
        });

        let index = handle.0 as usize;
        // taking the closure out lets it borrow the memory it runs in
        let mut function = self
            .functions
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(MemoryError::InvalidHandle(handle))?;
        let result = function(self, argv);
        self.functions[index] = Some(function);
        result
    }
}
