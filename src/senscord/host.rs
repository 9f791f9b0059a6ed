//! SensCord and send-data session native symbol routing.

use super::SenscordMock;
use crate::error::{senscord_status, sess_status, BridgeError, Result};
use crate::memory::GuestMemory;
use crate::symbols::{Args, HostModule, NativeSymbol, WasmValue, SENSCORD_SYMBOLS};
use tracing::warn;

impl HostModule for SenscordMock {
    fn symbols(&self) -> &'static [NativeSymbol] {
        SENSCORD_SYMBOLS.as_slice()
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

        match self.route(arena, native, &args) {
            Ok(result) => Ok(result),
            Err(BridgeError::Memory(e)) => {
                warn!(symbol = native.name, error = %e, "Guest passed an unreadable argument");
                let status = if native.name.starts_with("Sess") {
                    sess_status::INVALID_PARAM
                } else {
                    senscord_status::ERROR
                };
                Ok(Some(WasmValue::I32(status)))
            }
            Err(e) => Err(e),
        }
    }
}

impl SenscordMock {
    fn route(
        &self,
        arena: &mut dyn GuestMemory,
        native: &NativeSymbol,
        args: &Args<'_>,
    ) -> Result<Option<WasmValue>> {
        let status = match native.name {
            "senscord_core_init" => self.core_init(arena, args.addr(0)?),
            "senscord_core_exit" => self.core_exit(args.u64(0)?),
            "senscord_core_open_stream" => {
                let key = args.c_string(&*arena, 1)?;
                self.open_stream(arena, args.u64(0)?, &key, args.addr(2)?)
            }
            "senscord_core_close_stream" => self.close_stream(args.u64(0)?, args.u64(1)?),
            "senscord_stream_start" => self.stream_start(args.u64(0)?),
            "senscord_stream_stop" => self.stream_stop(args.u64(0)?),
            "senscord_stream_get_frame" => {
                self.get_frame(arena, args.u64(0)?, args.addr(1)?, args.i32(2)?)
            }
            "senscord_stream_release_frame" => {
                self.release_frame(arena, args.u64(0)?, args.u64(1)?)
            }
            "senscord_stream_get_property" => {
                let key = arena.read_c_string(args.addr(1)?)?;
                self.get_property(arena, args.u64(0)?, &key, args.addr(2)?, args.u32(3)?)
            }
            "senscord_stream_set_property" => {
                let key = arena.read_c_string(args.addr(1)?)?;
                self.set_property(args.u64(0)?, &key, args.u32(3)?)
            }
            "senscord_stream_register_frame_callback" => {
                self.register_frame_callback(args.u64(0)?, args.handle(1)?, args.u32(2)?)
            }
            "senscord_stream_unregister_frame_callback" => {
                self.unregister_frame_callback(args.u64(0)?)
            }
            "senscord_frame_get_channel" => {
                self.get_channel(arena, args.u64(0)?, args.u32(1)?, args.addr(2)?)
            }
            "senscord_channel_get_raw_data" => {
                self.channel_get_raw_data(arena, args.u64(0)?, args.addr(1)?)
            }
            "senscord_channel_get_property" => {
                let key = arena.read_c_string(args.addr(1)?)?;
                self.channel_get_property(arena, args.u64(0)?, &key, args.addr(2)?, args.u32(3)?)
            }
            "frame_bbox" => self.frame_bbox(
                arena,
                args.addr(0)?,
                args.addr(1)?,
                args.f32(2)?,
                args.f32(3)?,
            ),
            "senscord_ub_create_stream" => {
                let name = args.c_string(&*arena, 0)?;
                let pixel_format = args.c_string(&*arena, 4)?;
                let handle = self.ub_create_stream(
                    &name,
                    args.u32(1)?,
                    args.u32(2)?,
                    args.u32(3)?,
                    &pixel_format,
                );
                return Ok(Some(WasmValue::from(handle)));
            }
            "senscord_ub_send_data" => self.ub_send_data(args.u64(0)?, args.addr(1)?),
            "senscord_ub_destroy_stream" => self.ub_destroy_stream(args.u64(0)?),
            "senscord_memcpy" => self.memcpy(arena, args.addr(0)?, args.u64(1)?, args.u32(2)?),
            "senscord_get_last_error" => {
                self.get_last_error();
                return Ok(None);
            }
            "SessInit" => self.sess_init(),
            "SessExit" => self.sess_exit(),
            "SessRegisterSendDataCallback" => {
                self.sess_register_send_data_callback(args.handle(0)?, args.u32(1)?)
            }
            "SessUnregisterSendDataCallback" => self.sess_unregister_send_data_callback(),
            "SessSendData" => {
                let payload = args.bytes(&*arena, 0)?;
                self.sess_send_data(arena, args.addr(0)?, payload, args.u64(2)?)
            }
            other => {
                return Err(BridgeError::UnknownSymbol {
                    module: self.module_name().to_string(),
                    symbol: other.to_string(),
                })
            }
        };
        Ok(Some(WasmValue::I32(status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::memory::{nul_terminated, GuestAddr, LinearMemory};
    use crate::senscord::SenscordApiCall;

    fn setup() -> (SenscordMock, LinearMemory) {
        let config = BridgeConfig::new().with_frame_size(2, 2);
        (
            SenscordMock::new(config).unwrap(),
            LinearMemory::new(64 * 1024),
        )
    }

    fn put_str(mem: &mut LinearMemory, text: &str) -> GuestAddr {
        let bytes = nul_terminated(text);
        let addr = mem.allocate(bytes.len() as u32);
        mem.write(addr, &bytes).unwrap();
        addr
    }

    #[test]
    fn test_every_symbol_has_a_route() {
        let (sensor, _) = setup();
        for symbol in sensor.symbols() {
            assert!(symbol.parsed_signature().is_ok(), "{}", symbol.name);
        }
        assert_eq!(sensor.symbols().len(), 26);
    }

    #[test]
    fn test_open_stream_through_symbol() {
        let (sensor, mut mem) = setup();
        let key = put_str(&mut mem, "inference_stream");
        let out = mem.allocate(8);

        let result = sensor
            .call(
                &mut mem,
                "senscord_core_open_stream",
                &[
                    WasmValue::I64(999),
                    WasmValue::from(key.0),
                    WasmValue::from(out.0),
                ],
            )
            .unwrap();
        assert_eq!(result, Some(WasmValue::I32(senscord_status::OK)));
        assert!(matches!(
            &sensor.api_calls()[0].call,
            SenscordApiCall::OpenStream { stream_key, .. } if stream_key == "inference_stream"
        ));
    }

    #[test]
    fn test_ub_create_stream_returns_i64() {
        let (sensor, mut mem) = setup();
        let name = put_str(&mut mem, "out");
        let format = put_str(&mut mem, "image_rgb24");
        let result = sensor
            .call(
                &mut mem,
                "senscord_ub_create_stream",
                &[
                    WasmValue::from(name.0),
                    WasmValue::I32(2),
                    WasmValue::I32(2),
                    WasmValue::I32(6),
                    WasmValue::from(format.0),
                ],
            )
            .unwrap();
        assert_eq!(result, Some(WasmValue::I64(1)));
    }

    #[test]
    fn test_get_last_error_has_no_result() {
        let (sensor, mut mem) = setup();
        let result = sensor
            .call(&mut mem, "senscord_get_last_error", &[WasmValue::I32(0)])
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_frame_bbox_through_symbol() {
        let (sensor, mut mem) = setup();
        let roi = mem.allocate(16);
        mem.write(roi, &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0])
            .unwrap();
        sensor
            .call(
                &mut mem,
                "frame_bbox",
                &[
                    WasmValue::I32(0),
                    WasmValue::from(roi.0),
                    WasmValue::F32(1.0),
                    WasmValue::F32(0.5),
                ],
            )
            .unwrap();
        let detections = sensor.detections();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].region.right, 4);
    }

    #[test]
    fn test_send_data_bad_payload() {
        let (sensor, mut mem) = setup();
        let result = sensor
            .call(
                &mut mem,
                "SessSendData",
                &[
                    WasmValue::I32(0x7fff_0000),
                    WasmValue::I32(16),
                    WasmValue::I64(0),
                ],
            )
            .unwrap();
        assert_eq!(result, Some(WasmValue::I32(sess_status::INVALID_PARAM)));
    }

    #[test]
    fn test_float_where_int_expected() {
        let (sensor, mut mem) = setup();
        let err = sensor
            .call(&mut mem, "senscord_stream_start", &[WasmValue::F32(1.0)])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Signature(_)));
    }
}
