//! `EVP_*` native symbol routing.

use super::{BlobRequest, EvpMock, TelemetryEntry};
use crate::error::{BridgeError, MemoryError, Result};
use crate::memory::{GuestAddr, GuestMemory};
use crate::symbols::{Args, HostModule, NativeSymbol, WasmValue, EVP_SYMBOLS};
use tracing::warn;

/// Size of one `struct EVP_telemetry_entry` on wasm32 (two pointers)
const TELEMETRY_ENTRY_SIZE: u32 = 8;

impl HostModule for EvpMock {
    fn symbols(&self) -> &'static [NativeSymbol] {
        EVP_SYMBOLS.as_slice()
    }

    fn call(
        &self,
        arena: &mut dyn GuestMemory,
        symbol: &str,
        args: &[WasmValue],
    ) -> Result<Option<WasmValue>> {
        let native = self.resolve(symbol)?;
        let args = Args::bind(native, args)?;
        self.metrics.record_host_call(native.name);

        let status = match self.route(arena, native, &args) {
            Ok(status) => status,
            Err(BridgeError::Memory(e)) => {
                warn!(symbol = native.name, error = %e, "Guest passed an unreadable argument");
                BridgeError::Memory(e).to_evp_status()
            }
            Err(e) => return Err(e),
        };
        Ok(Some(WasmValue::I32(status)))
    }
}

impl EvpMock {
    fn route(
        &self,
        arena: &mut dyn GuestMemory,
        native: &NativeSymbol,
        args: &Args<'_>,
    ) -> Result<i32> {
        let status = match native.name {
            "EVP_initialize" => self.initialize() as i32,
            "EVP_getWorkspaceDirectory" => {
                self.get_workspace_directory(arena, args.u32(0)?, args.u32(1)?).0 as i32
            }
            "EVP_processEvent" => self.process_event(arena, args.u32(0)?, args.u32(1)?),
            "EVP_setConfigurationCallback" => {
                self.set_configuration_callback(args.u32(0)?, args.handle(1)?, args.u32(2)?)
            }
            "EVP_setMessageCallback" => {
                self.set_message_callback(args.u32(0)?, args.handle(1)?, args.u32(2)?)
            }
            "EVP_setRpcCallback" => {
                self.set_rpc_callback(args.u32(0)?, args.handle(1)?, args.u32(2)?)
            }
            "EVP_sendState" => {
                let topic = args.c_string(&*arena, 1)?;
                let payload = args.bytes(&*arena, 2)?;
                self.send_state(args.u32(0)?, &topic, &payload, args.handle(4)?, args.u32(5)?)
            }
            "EVP_sendTelemetry" => {
                let entries = read_telemetry(&*arena, args.addr(1)?, args.u32(2)?)?;
                self.send_telemetry(args.u32(0)?, entries, args.handle(3)?, args.u32(4)?)
            }
            "EVP_sendMessage" => {
                let topic = args.c_string(&*arena, 1)?;
                let payload = args.bytes(&*arena, 2)?;
                self.send_message(args.u32(0)?, &topic, &payload, args.handle(4)?, args.u32(5)?)
            }
            "EVP_sendRpcResponse" => {
                let response = args.c_string(&*arena, 2)?;
                self.send_rpc_response(
                    args.u32(0)?,
                    args.u64(1)?,
                    &response,
                    args.u32(3)?,
                    args.handle(4)?,
                    args.u32(5)?,
                )
            }
            "EVP_blobOperation" => {
                let request = args.addr(3)?;
                let blob = BlobRequest {
                    blob_type: args.u32(1)?,
                    operation: args.u32(2)?,
                    request,
                    url: read_request_url(&*arena, request),
                    local_store: args.addr(4)?,
                };
                self.blob_operation(args.u32(0)?, blob, args.handle(5)?, args.u32(6)?)
            }
            other => {
                return Err(BridgeError::UnknownSymbol {
                    module: self.module_name().to_string(),
                    symbol: other.to_string(),
                })
            }
        };
        Ok(status)
    }
}

fn read_u32(arena: &dyn GuestMemory, addr: GuestAddr) -> Result<u32> {
    let bytes = arena.read(addr, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The whole entry array is bounds-checked before anything is allocated
fn read_telemetry(
    arena: &dyn GuestMemory,
    entries: GuestAddr,
    count: u32,
) -> Result<Vec<TelemetryEntry>> {
    let len = count
        .checked_mul(TELEMETRY_ENTRY_SIZE)
        .ok_or(MemoryError::OutOfBounds {
            addr: entries,
            len: u32::MAX,
        })?;
    let block = arena.read(entries, len)?;
    block
        .chunks_exact(TELEMETRY_ENTRY_SIZE as usize)
        .map(|entry| -> Result<TelemetryEntry> {
            let key = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let value = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
            Ok(TelemetryEntry {
                key: arena.read_c_string(GuestAddr(key))?,
                value: arena.read_c_string(GuestAddr(value))?,
            })
        })
        .collect()
}

/// The request blocks of every blob type start with a `const char *url`
fn read_request_url(arena: &dyn GuestMemory, request: GuestAddr) -> Option<String> {
    if request.is_null() {
        return None;
    }
    let url = read_u32(arena, request).ok()?;
    if url == 0 {
        return None;
    }
    arena.read_c_string(GuestAddr(url)).ok()
}
