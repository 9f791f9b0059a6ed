//! Native symbol tables.
//!
//! Each mock exposes its guest operations as named native symbols with a
//! WAMR-style signature string. An engine registers the table, then routes every
//! guest import call to [`HostModule::call`] with the raw wasm values.
//!
//! Signature characters: `i` i32, `I` i64, `f` f32, `F` f64, `*` pointer,
//! `~` byte length of the preceding pointer, `$` NUL-terminated string. The
//! result, if any, follows the closing parenthesis.

use crate::error::{BridgeError, Result};
use crate::memory::{FunctionHandle, GuestAddr, GuestMemory};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A wasm value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

/// One parameter of a native signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// `i`
    I32,
    /// `I`
    I64,
    /// `f`
    F32,
    /// `F`
    F64,
    /// `*`
    Pointer,
    /// `~`
    Length,
    /// `$`
    CString,
}

impl ParamKind {
    /// The wasm value type carrying this parameter
    pub fn value_kind(self) -> ValueKind {
        match self {
            ParamKind::I64 => ValueKind::I64,
            ParamKind::F32 => ValueKind::F32,
            ParamKind::F64 => ValueKind::F64,
            ParamKind::I32 | ParamKind::Pointer | ParamKind::Length | ParamKind::CString => {
                ValueKind::I32
            }
        }
    }
}

/// A parsed signature string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Parameters in order
    pub params: Vec<ParamKind>,
    /// Return type, if any
    pub result: Option<ValueKind>,
}

impl Signature {
    /// Parse a WAMR signature string such as `"(i$*~ii)i"`
    pub fn parse(text: &str) -> Result<Self> {
        let bad = |reason: &str| BridgeError::Signature(format!("'{}': {}", text, reason));

        let inner = text.strip_prefix('(').ok_or_else(|| bad("missing '('"))?;
        let (params_text, result_text) = inner.split_once(')').ok_or_else(|| bad("missing ')'"))?;

        let mut params = Vec::with_capacity(params_text.len());
        for c in params_text.chars() {
            let param = match c {
                'i' => ParamKind::I32,
                'I' => ParamKind::I64,
                'f' => ParamKind::F32,
                'F' => ParamKind::F64,
                '*' => ParamKind::Pointer,
                '$' => ParamKind::CString,
                '~' => {
                    if params.last() != Some(&ParamKind::Pointer) {
                        return Err(bad("'~' must follow '*'"));
                    }
                    ParamKind::Length
                }
                other => return Err(bad(&format!("unknown parameter type '{}'", other))),
            };
            params.push(param);
        }

        let result = match result_text {
            "" => None,
            "i" => Some(ValueKind::I32),
            "I" => Some(ValueKind::I64),
            "f" => Some(ValueKind::F32),
            "F" => Some(ValueKind::F64),
            other => return Err(bad(&format!("bad result type '{}'", other))),
        };

        Ok(Self { params, result })
    }

    /// Number of wasm arguments
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl FromStr for Signature {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Signature::parse(s)
    }
}

/// A native function the guest can import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NativeSymbol {
    /// Import name
    pub name: &'static str,
    /// WAMR signature string
    pub signature: &'static str,
}

impl NativeSymbol {
    /// Describe a symbol
    pub const fn new(name: &'static str, signature: &'static str) -> Self {
        Self { name, signature }
    }

    /// Parse this symbol's signature
    pub fn parsed_signature(&self) -> Result<Signature> {
        Signature::parse(self.signature)
    }
}

/// A raw wasm value crossing the import boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WasmValue {
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl WasmValue {
    /// Value type
    pub fn kind(&self) -> ValueKind {
        match self {
            WasmValue::I32(_) => ValueKind::I32,
            WasmValue::I64(_) => ValueKind::I64,
            WasmValue::F32(_) => ValueKind::F32,
            WasmValue::F64(_) => ValueKind::F64,
        }
    }

    /// The value as an i32, if it is one
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WasmValue::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for WasmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WasmValue::I32(v) => write!(f, "{}:i32", v),
            WasmValue::I64(v) => write!(f, "{}:i64", v),
            WasmValue::F32(v) => write!(f, "{}:f32", v),
            WasmValue::F64(v) => write!(f, "{}:f64", v),
        }
    }
}

impl From<i32> for WasmValue {
    fn from(v: i32) -> Self {
        WasmValue::I32(v)
    }
}

impl From<u32> for WasmValue {
    fn from(v: u32) -> Self {
        WasmValue::I32(v as i32)
    }
}

impl From<i64> for WasmValue {
    fn from(v: i64) -> Self {
        WasmValue::I64(v)
    }
}

impl From<u64> for WasmValue {
    fn from(v: u64) -> Self {
        WasmValue::I64(v as i64)
    }
}

impl From<f32> for WasmValue {
    fn from(v: f32) -> Self {
        WasmValue::F32(v)
    }
}

/// Symbols provided by [`crate::evp::EvpMock`]
pub static EVP_SYMBOLS: Lazy<Vec<NativeSymbol>> = Lazy::new(|| {
    vec![
        NativeSymbol::new("EVP_initialize", "()i"),
        NativeSymbol::new("EVP_getWorkspaceDirectory", "(ii)i"),
        NativeSymbol::new("EVP_processEvent", "(ii)i"),
        NativeSymbol::new("EVP_setConfigurationCallback", "(iii)i"),
        NativeSymbol::new("EVP_setMessageCallback", "(iii)i"),
        NativeSymbol::new("EVP_setRpcCallback", "(iii)i"),
        NativeSymbol::new("EVP_sendState", "(i$*~ii)i"),
        NativeSymbol::new("EVP_sendTelemetry", "(iiiii)i"),
        NativeSymbol::new("EVP_sendMessage", "(i$*~ii)i"),
        NativeSymbol::new("EVP_sendRpcResponse", "(iI$iii)i"),
        NativeSymbol::new("EVP_blobOperation", "(iiiiiii)i"),
    ]
});

/// Symbols provided by [`crate::senscord::SenscordMock`]
pub static SENSCORD_SYMBOLS: Lazy<Vec<NativeSymbol>> = Lazy::new(|| {
    vec![
        NativeSymbol::new("senscord_core_init", "(i)i"),
        NativeSymbol::new("senscord_core_exit", "(I)i"),
        NativeSymbol::new("senscord_core_open_stream", "(I$i)i"),
        NativeSymbol::new("senscord_core_close_stream", "(II)i"),
        NativeSymbol::new("senscord_stream_start", "(I)i"),
        NativeSymbol::new("senscord_stream_stop", "(I)i"),
        NativeSymbol::new("senscord_stream_get_frame", "(Iii)i"),
        NativeSymbol::new("senscord_stream_release_frame", "(II)i"),
        NativeSymbol::new("senscord_stream_get_property", "(Iiii)i"),
        NativeSymbol::new("senscord_stream_set_property", "(Iiii)i"),
        NativeSymbol::new("senscord_stream_register_frame_callback", "(Iii)i"),
        NativeSymbol::new("senscord_stream_unregister_frame_callback", "(I)i"),
        NativeSymbol::new("senscord_frame_get_channel", "(Iii)i"),
        NativeSymbol::new("senscord_channel_get_raw_data", "(Ii)i"),
        NativeSymbol::new("senscord_channel_get_property", "(Iiii)i"),
        NativeSymbol::new("frame_bbox", "(iiff)i"),
        NativeSymbol::new("senscord_ub_create_stream", "($iii$)I"),
        NativeSymbol::new("senscord_ub_send_data", "(Ii)i"),
        NativeSymbol::new("senscord_ub_destroy_stream", "(I)i"),
        NativeSymbol::new("senscord_memcpy", "(iIi)i"),
        NativeSymbol::new("senscord_get_last_error", "(i)"),
        NativeSymbol::new("SessInit", "()i"),
        NativeSymbol::new("SessExit", "()i"),
        NativeSymbol::new("SessRegisterSendDataCallback", "(ii)i"),
        NativeSymbol::new("SessUnregisterSendDataCallback", "()i"),
        NativeSymbol::new("SessSendData", "(*~I)i"),
    ]
});

/// A mock domain seen from the engine: a symbol table plus a call router
pub trait HostModule {
    /// Import module name
    fn module_name(&self) -> &'static str {
        "env"
    }

    /// Symbols this module provides
    fn symbols(&self) -> &'static [NativeSymbol];

    /// Route one guest import call to the typed operation
    fn call(
        &self,
        arena: &mut dyn GuestMemory,
        symbol: &str,
        args: &[WasmValue],
    ) -> Result<Option<WasmValue>>;

    /// Find a symbol by name
    fn resolve(&self, symbol: &str) -> Result<&'static NativeSymbol> {
        self.symbols()
            .iter()
            .find(|s| s.name == symbol)
            .ok_or_else(|| BridgeError::UnknownSymbol {
                module: self.module_name().to_string(),
                symbol: symbol.to_string(),
            })
    }
}

/// Arguments of one call, checked against the symbol's signature
pub struct Args<'a> {
    symbol: &'static NativeSymbol,
    values: &'a [WasmValue],
}

impl<'a> Args<'a> {
    /// Check arity and value types
    pub fn bind(symbol: &'static NativeSymbol, values: &'a [WasmValue]) -> Result<Self> {
        let signature = symbol.parsed_signature()?;
        if values.len() != signature.arity() {
            return Err(BridgeError::Signature(format!(
                "{} expects {} arguments, got {}",
                symbol.name,
                signature.arity(),
                values.len()
            )));
        }
        for (index, (param, value)) in signature.params.iter().zip(values).enumerate() {
            if param.value_kind() != value.kind() {
                return Err(BridgeError::Signature(format!(
                    "{} argument {}: expected {:?}, got {}",
                    symbol.name,
                    index,
                    param.value_kind(),
                    value
                )));
            }
        }
        Ok(Self { symbol, values })
    }

    fn value(&self, index: usize) -> Result<WasmValue> {
        self.values.get(index).copied().ok_or_else(|| {
            BridgeError::Signature(format!("{} has no argument {}", self.symbol.name, index))
        })
    }

    /// Argument as i32
    pub fn i32(&self, index: usize) -> Result<i32> {
        match self.value(index)? {
            WasmValue::I32(v) => Ok(v),
            other => Err(self.mismatch(index, other)),
        }
    }

    /// Argument as u32 (pointer, length, handle or enum)
    pub fn u32(&self, index: usize) -> Result<u32> {
        self.i32(index).map(|v| v as u32)
    }

    /// Argument as u64
    pub fn u64(&self, index: usize) -> Result<u64> {
        match self.value(index)? {
            WasmValue::I64(v) => Ok(v as u64),
            other => Err(self.mismatch(index, other)),
        }
    }

    /// Argument as f32
    pub fn f32(&self, index: usize) -> Result<f32> {
        match self.value(index)? {
            WasmValue::F32(v) => Ok(v),
            other => Err(self.mismatch(index, other)),
        }
    }

    /// Argument as a guest address
    pub fn addr(&self, index: usize) -> Result<GuestAddr> {
        self.u32(index).map(GuestAddr)
    }

    /// Argument as a guest function handle
    pub fn handle(&self, index: usize) -> Result<FunctionHandle> {
        self.u32(index).map(FunctionHandle)
    }

    /// `$` argument read out of guest memory
    pub fn c_string(&self, arena: &dyn GuestMemory, index: usize) -> Result<String> {
        Ok(arena.read_c_string(self.addr(index)?)?)
    }

    /// `*~` argument pair starting at `index`, read out of guest memory
    pub fn bytes(&self, arena: &dyn GuestMemory, index: usize) -> Result<Vec<u8>> {
        let addr = self.addr(index)?;
        let len = self.u32(index + 1)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(arena.read(addr, len)?)
    }

    fn mismatch(&self, index: usize, value: WasmValue) -> BridgeError {
        BridgeError::Signature(format!(
            "{} argument {} has unexpected type {}",
            self.symbol.name, index, value
        ))
    }
}
