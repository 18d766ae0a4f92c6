//! # sync-core
//!
//! Pure sync engine for wearable history transfers (no I/O, instant tests).
//!
//! This crate implements the state machines that pull historical data off a
//! wearable: chunk reassembly, sequence and checksum verification, the
//! per-round fetch handshake, round scheduling across data kinds, and GFDI
//! request/status correlation.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (BLE writes, decoder hand-off, state files) is performed by
//! `sync-client`, which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod correlator;
pub mod decode;
pub mod download;
mod error;
pub mod event;
pub mod family;
pub mod integrity;
pub mod reassembler;
pub mod round;
pub mod scheduler;
pub mod sequence;
pub mod watermark;

pub use correlator::{Incoming, PendingRequest, StatusMessageCorrelator};
pub use decode::{DecodeError, DecodedPayload, SampleDecoder};
pub use download::{DownloadStep, FileDownload};
pub use error::ProtocolError;
pub use event::{AbortReason, RoundOutcome, SyncEvent};
pub use family::{Chunk, ControlMessage, FamilyCapabilities, FamilyCodec, HuamiCodec};
pub use integrity::{IntegrityVerifier, MismatchPolicy, VerifiedPayload};
pub use reassembler::{AppendResult, ChunkReassembler, OverflowPolicy};
pub use round::{FetchRound, FetchRoundContext, RoundAction, RoundEvent, RoundState};
pub use scheduler::RoundScheduler;
pub use sequence::SequenceGuard;
pub use watermark::{MemoryWatermarkStore, WatermarkError, WatermarkStore};
