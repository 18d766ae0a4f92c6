//! Transport abstraction for wearable sync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! underlying link (a BLE GATT connection in production, mock for testing).
//!
//! # Design
//!
//! A wearable exposes two endpoints: a control characteristic that carries
//! requests and responses, and a data characteristic that streams chunks.
//! The transport trait is async and endpoint-addressed:
//! - `connect()` establishes a connection
//! - `send()` writes bytes to one endpoint
//! - `recv()` returns the next notification and the endpoint it came from
//! - `close()` gracefully terminates
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect("C8:0F:10:AA:BB:CC").await?;
//! transport.send(EndpointId::Control, &request).await?;
//! let (endpoint, bytes) = transport.recv().await?;
//! ```

mod mock;

pub use mock::{Fault, MockTransport, Responder};

use async_trait::async_trait;
use sync_types::EndpointId;
use thiserror::Error;

/// Link-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device could not be reached.
    #[error("could not connect to {address}: {reason}")]
    ConnectFailed {
        /// Address that was dialled.
        address: String,
        /// Adapter-reported cause.
        reason: String,
    },

    /// No connection has been established.
    #[error("device not connected")]
    NotConnected,

    /// The device dropped the link.
    #[error("device disconnected")]
    Disconnected,

    /// A characteristic write was rejected.
    #[error("write to {endpoint:?} failed: {reason}")]
    WriteFailed {
        /// Endpoint written to.
        endpoint: EndpointId,
        /// Adapter-reported cause.
        reason: String,
    },

    /// A write did not fit in one ATT packet.
    #[error("{len}-byte write exceeds the {mtu}-byte MTU")]
    PayloadTooLarge {
        /// Bytes in the write.
        len: usize,
        /// Largest payload the link accepts.
        mtu: usize,
    },

    /// A notification could not be read.
    #[error("notification failed: {0}")]
    NotifyFailed(String),
}

/// Transport trait for talking to one device.
///
/// Implementations handle the underlying link (BLE, serial bridge, mock).
/// Notifications must be returned in arrival order across both endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the device identified by the given address.
    ///
    /// For BLE this is the MAC address. For testing, it's arbitrary.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Write bytes to an endpoint.
    async fn send(&self, endpoint: EndpointId, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next notification.
    ///
    /// Blocks until data is available or the connection closes.
    async fn recv(&self) -> Result<(EndpointId, Vec<u8>), TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
