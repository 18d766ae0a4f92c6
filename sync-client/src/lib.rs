//! # sync-client
//!
//! Async driver for wearable history sync.
//!
//! This is the library applications use to pull history off a device.
//!
//! ## Features
//!
//! - **Transport Abstraction**: Pluggable endpoint-addressed transport (BLE, mock)
//! - **Pure State Machine**: Uses sync-core for side-effect-free protocol logic
//! - **Response Timeouts**: Every device wait is bounded by the family's timeout
//! - **Durable Watermarks**: JSON state file written with atomic renames
//! - **GFDI Channel**: Request/status round-trips and file downloads
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::{FixedIntervalDecoder, JsonWatermarkStore, SyncSession, Transport};
//! use sync_core::HuamiCodec;
//!
//! transport.connect("C8:0F:10:AA:BB:CC").await?;
//! let store = JsonWatermarkStore::open("state.json")?;
//! let mut session = SyncSession::new(
//!     transport,
//!     store,
//!     FixedIntervalDecoder::new(),
//!     Arc::new(HuamiCodec::zepp_os()),
//! );
//! let report = session.sync(&[DataKind::Activity, DataKind::Spo2], since).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod gfdi;
pub mod session;
pub mod sim;
pub mod store;
pub mod transport;

pub use decoder::{FixedIntervalDecoder, RawSample, SampleLayout};
pub use gfdi::{GfdiChannel, GfdiError};
pub use session::{CancelHandle, RoundRecord, SessionError, SyncReport, SyncSession};
pub use sim::SimulatedDevice;
pub use store::JsonWatermarkStore;
pub use transport::{Fault, MockTransport, Responder, Transport, TransportError};
