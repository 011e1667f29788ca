use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use s2n_quic::provider::limits::Limits;

use crate::{codec::DEFAULT_MAX_FRAME_SIZE, RpcError};

/// Settings shared by [`crate::RpcServer`] and [`crate::RpcClient`].
///
/// On the server `cert_path` is the certificate chain presented to clients and
/// `key_path` its private key. On the client `cert_path` is the CA certificate
/// used to verify the server and `bind_address` is the local socket to use.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub cert_path: PathBuf,

    pub key_path: Option<PathBuf>,

    pub server_name: String,

    pub bind_address: String,

    pub keep_alive_interval: Option<Duration>,

    /// Messages buffered per call direction before senders wait.
    pub message_buffer: usize,

    pub max_frame_size: usize,
}

impl RpcConfig {
    pub fn new<P: Into<PathBuf>>(cert_path: P, bind_address: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: None,
            server_name: "localhost".to_string(),
            bind_address: bind_address.into(),
            keep_alive_interval: Some(Duration::from_secs(30)),
            message_buffer: 32,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_key_path<P: Into<PathBuf>>(mut self, key_path: P) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    pub fn with_message_buffer(mut self, buffer: usize) -> Self {
        self.message_buffer = buffer.max(1);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// Transport limits used on both ends of a connection.
pub(crate) fn quic_limits() -> Result<Limits, RpcError> {
    let limits = Limits::new()
        // Every call is its own stream
        .with_max_open_local_bidirectional_streams(10_000)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set stream limits: {:?}", e)))?
        .with_max_open_remote_bidirectional_streams(10_000)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set stream limits: {:?}", e)))?
        .with_data_window(16 * 1024 * 1024)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set data window: {:?}", e)))?
        .with_bidirectional_local_data_window(8 * 1024 * 1024)
        .map_err(|e| {
            RpcError::ConfigError(format!("Failed to set bidirectional window: {:?}", e))
        })?
        .with_initial_round_trip_time(Duration::from_millis(1))
        .map_err(|e| RpcError::ConfigError(format!("Failed to set RTT: {:?}", e)))?
        .with_max_ack_delay(Duration::from_millis(5))
        .map_err(|e| RpcError::ConfigError(format!("Failed to set ACK delay: {:?}", e)))?
        .with_max_send_buffer_size(2 * 1024 * 1024)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set send buffer: {:?}", e)))?;
    Ok(limits)
}

pub(crate) fn canonicalize_path(path: &Path) -> Result<PathBuf, RpcError> {
    fs::canonicalize(path).map_err(|e| {
        RpcError::ConfigError(format!("Failed to canonicalize {}: {e}", path.display()))
    })
}
