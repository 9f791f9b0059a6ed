//! C structure layouts shared with the guest.
//!
//! All blocks are little-endian with natural alignment, matching what a wasm32
//! guest compiled against the SDK headers reads and writes.

use super::{GuestAddr, GuestMemory};
use crate::error::MemoryError;
use serde::{Deserialize, Serialize};

/// A fixed-size structure exchanged by reference with the guest
pub trait GuestStruct: Sized {
    /// Size in bytes
    const SIZE: u32;

    /// Serialize into exactly `SIZE` bytes
    fn encode(&self, out: &mut [u8]);

    /// Deserialize from exactly `SIZE` bytes
    fn decode(bytes: &[u8]) -> Self;

    /// Store at a guest address
    fn store(&self, arena: &mut dyn GuestMemory, addr: GuestAddr) -> Result<(), MemoryError> {
        let region = arena.native_region(addr, Self::SIZE)?;
        self.encode(region);
        Ok(())
    }

    /// Load from a guest address
    fn load(arena: &mut dyn GuestMemory, addr: GuestAddr) -> Result<Self, MemoryError> {
        let region = arena.native_region(addr, Self::SIZE)?;
        Ok(Self::decode(region))
    }

    /// Encode into a fresh vector
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE as usize];
        self.encode(&mut out);
        out
    }
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// `senscord_raw_data_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawData {
    /// Guest address of the frame bytes
    pub address: u64,
    /// Frame size in bytes
    pub size: u32,
    /// Data type tag
    pub data_type: u32,
    /// Capture timestamp in nanoseconds
    pub timestamp: u64,
}

impl GuestStruct for RawData {
    const SIZE: u32 = 24;

    fn encode(&self, out: &mut [u8]) {
        put_u64(out, 0, self.address);
        put_u32(out, 8, self.size);
        put_u32(out, 12, self.data_type);
        put_u64(out, 16, self.timestamp);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            address: get_u64(bytes, 0),
            size: get_u32(bytes, 8),
            data_type: get_u32(bytes, 12),
            timestamp: get_u64(bytes, 16),
        }
    }
}

/// `senscord_image_property_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProperty {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row stride in bytes
    pub stride_bytes: u32,
    /// Pixel format tag
    pub pixel_format: u32,
}

impl GuestStruct for ImageProperty {
    const SIZE: u32 = 16;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.width);
        put_u32(out, 4, self.height);
        put_u32(out, 8, self.stride_bytes);
        put_u32(out, 12, self.pixel_format);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            width: get_u32(bytes, 0),
            height: get_u32(bytes, 4),
            stride_bytes: get_u32(bytes, 8),
            pixel_format: get_u32(bytes, 12),
        }
    }
}

/// `senscord_rectangle_region_parameter_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectangleRegion {
    /// Top edge
    pub top: u32,
    /// Left edge
    pub left: u32,
    /// Bottom edge
    pub bottom: u32,
    /// Right edge
    pub right: u32,
}

impl GuestStruct for RectangleRegion {
    const SIZE: u32 = 16;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.top);
        put_u32(out, 4, self.left);
        put_u32(out, 8, self.bottom);
        put_u32(out, 12, self.right);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            top: get_u32(bytes, 0),
            left: get_u32(bytes, 4),
            bottom: get_u32(bytes, 8),
            right: get_u32(bytes, 12),
        }
    }
}

/// `EVP_BlobResultEvp`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobResultEvp {
    /// `EVP_BLOB_RESULT`
    pub result: u32,
    /// HTTP status of the transfer
    pub http_status: u32,
    /// errno-style error, 0 on success
    pub error: i32,
}

impl BlobResultEvp {
    /// A successful transfer
    pub fn success() -> Self {
        Self {
            result: 0,
            http_status: 200,
            error: 0,
        }
    }
}

impl GuestStruct for BlobResultEvp {
    const SIZE: u32 = 12;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.result);
        put_u32(out, 4, self.http_status);
        out[8..12].copy_from_slice(&self.error.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            result: get_u32(bytes, 0),
            http_status: get_u32(bytes, 4),
            error: get_u32(bytes, 8) as i32,
        }
    }
}
