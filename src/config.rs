//! Bridge configuration types and defaults.
//!
//! This module defines the knobs of a mock session: the handles the mocks hand
//! out, where the workspace directory points, and the simulated sensor frame.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default client handle returned by `EVP_initialize` / `senscord_core_init`
pub const DEFAULT_CLIENT_HANDLE: u32 = 999;

/// Default workspace sub-directory appended to the workspace root
pub const DEFAULT_WORKSPACE_SUBDIR: &str = "assets";

/// Environment variable holding the repository root
pub const WORKSPACE_ROOT_ENV: &str = "ROOT_REPOSITORY";

/// Default wait for the send-data callback round-trip (5 s)
pub const DEFAULT_SEND_DATA_TIMEOUT_MS: u32 = 5000;

/// Default simulated frame width
pub const DEFAULT_FRAME_WIDTH: u32 = 300;

/// Default simulated frame height
pub const DEFAULT_FRAME_HEIGHT: u32 = 300;

/// Default capture timestamp written into raw-data blocks
pub const DEFAULT_FRAME_TIMESTAMP_NS: u64 = 12_345_678;

/// Default stream handle written by `senscord_core_open_stream`
pub const DEFAULT_STREAM_HANDLE: u64 = 12_341_234;

/// Configuration for a mock session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Handle returned to the guest on initialization (default: 999)
    #[serde(default = "default_client_handle")]
    pub client_handle: u32,

    /// Workspace root (falls back to `$ROOT_REPOSITORY`, then ".")
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Sub-directory appended to the workspace root (default: "assets")
    #[serde(default = "default_workspace_subdir")]
    pub workspace_subdir: String,

    /// Timeout for the synchronous send-data callback (default: 5000)
    #[serde(default = "default_send_data_timeout")]
    pub send_data_timeout_ms: u32,

    /// Simulated frame width in pixels
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,

    /// Simulated frame height in pixels
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,

    /// Timestamp written into raw-data blocks
    #[serde(default = "default_frame_timestamp")]
    pub frame_timestamp_ns: u64,

    /// Stream handle handed out by `open_stream`
    #[serde(default = "default_stream_handle")]
    pub stream_handle: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_handle: DEFAULT_CLIENT_HANDLE,
            workspace_root: None,
            workspace_subdir: DEFAULT_WORKSPACE_SUBDIR.to_string(),
            send_data_timeout_ms: DEFAULT_SEND_DATA_TIMEOUT_MS,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            frame_timestamp_ns: DEFAULT_FRAME_TIMESTAMP_NS,
            stream_handle: DEFAULT_STREAM_HANDLE,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the workspace root taken from `$ROOT_REPOSITORY` if set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os(WORKSPACE_ROOT_ENV) {
            config.workspace_root = Some(PathBuf::from(root));
        }
        config
    }

    /// Load a JSON configuration file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the client handle
    pub fn with_client_handle(mut self, handle: u32) -> Self {
        self.client_handle = handle;
        self
    }

    /// Set the workspace root
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Set the workspace sub-directory
    pub fn with_workspace_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.workspace_subdir = subdir.into();
        self
    }

    /// Set the send-data round-trip timeout
    pub fn with_send_data_timeout(mut self, timeout_ms: u32) -> Self {
        self.send_data_timeout_ms = timeout_ms;
        self
    }

    /// Set the simulated frame size
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_width = width;
        self.frame_height = height;
        self
    }

    /// Set the stream handle
    pub fn with_stream_handle(mut self, handle: u64) -> Self {
        self.stream_handle = handle;
        self
    }

    /// Workspace path reported to the guest, without the trailing NUL
    ///
    /// The root is `workspace_root`, else `$ROOT_REPOSITORY` read at call time, else `.`.
    pub fn workspace_directory(&self) -> String {
        self.workspace_directory_with(std::env::var_os(WORKSPACE_ROOT_ENV).map(PathBuf::from))
    }

    fn workspace_directory_with(&self, env_root: Option<PathBuf>) -> String {
        let root = self
            .workspace_root
            .clone()
            .or(env_root)
            .unwrap_or_else(|| PathBuf::from("."));
        format!("{}/{}", root.display(), self.workspace_subdir)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_handle == 0 {
            return Err(ConfigError::InvalidValue {
                field: "client_handle".into(),
                reason: "must be non-zero, guests treat 0 as a failed init".into(),
            });
        }

        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "frame_width/frame_height".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.frame_width.checked_mul(3).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "frame_width".into(),
                reason: "stride overflows u32".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_client_handle() -> u32 {
    DEFAULT_CLIENT_HANDLE
}

fn default_workspace_subdir() -> String {
    DEFAULT_WORKSPACE_SUBDIR.to_string()
}

fn default_send_data_timeout() -> u32 {
    DEFAULT_SEND_DATA_TIMEOUT_MS
}

fn default_frame_width() -> u32 {
    DEFAULT_FRAME_WIDTH
}

fn default_frame_height() -> u32 {
    DEFAULT_FRAME_HEIGHT
}

fn default_frame_timestamp() -> u64 {
    DEFAULT_FRAME_TIMESTAMP_NS
}

fn default_stream_handle() -> u64 {
    DEFAULT_STREAM_HANDLE
}
