//! Runtime and server configuration.
//!
//! Both structures follow the same builder shape: start from `Default` (or
//! `new`) and refine with `with_*` methods.

use crate::runtime::error::BridgeError;
use crate::runtime::value::{MAX_VALUE_BYTES, MAX_VALUE_DEPTH};
use std::net::SocketAddr;

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, BridgeError> {
    if host.trim().is_empty() {
        return Err(BridgeError::Runtime("server host cannot be empty".to_string()));
    }

    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    candidate.parse::<SocketAddr>().map_err(|err| {
        BridgeError::Runtime(format!("invalid server address '{candidate}': {err}"))
    })
}

/// Configuration for a bridge runtime thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum nesting accepted when materializing or exporting a value.
    pub max_depth: usize,
    /// Maximum encoded size accepted when materializing or exporting a value.
    pub max_bytes: usize,
    /// Name of the dedicated OS thread.
    pub thread_name: String,
    /// Number of faults buffered for slow fault subscribers.
    pub fault_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_depth: MAX_VALUE_DEPTH,
            max_bytes: MAX_VALUE_BYTES,
            thread_name: "reactive-bridge-runtime".to_string(),
            fault_capacity: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_fault_capacity(mut self, capacity: usize) -> Self {
        self.fault_capacity = capacity.max(1);
        self
    }
}

/// Listener configuration for the protocol server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Result<Self, BridgeError> {
        Ok(Self {
            address: parse_socket_addr(host, port)?,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.address
    }
}
