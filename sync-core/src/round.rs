//! Fetch round state machine.
//!
//! One round is one request → stream → verify → ack cycle for a single data
//! kind. The machine is pure: [`FetchRound::handle`] takes an event and
//! returns the actions the driver must perform. It never touches the
//! transport, the decoder or the watermark store itself.
//!
//! ```text
//! Idle ─Start─▶ AwaitingMetadata ─len>0─▶ Streaming ─complete─▶ Verifying
//!                      │                                            │
//!                    len=0                                   Decode / Decoded
//!                      ▼                                            ▼
//!                 Acknowledging ◀──────────────────────────── Acknowledging
//!                      │
//!                      ▼
//!               Done | Aborted
//! ```

use crate::decode::{DecodeError, DecodedPayload};
use crate::event::{AbortReason, RoundOutcome, SyncEvent};
use crate::family::{ControlMessage, FamilyCapabilities, FamilyCodec};
use crate::integrity::{IntegrityVerifier, MismatchPolicy, VerifiedPayload};
use crate::reassembler::{AppendResult, ChunkReassembler};
use crate::sequence::{SequenceGuard, INITIAL_COUNTER};
use std::sync::Arc;
use sync_types::{hex_dump, DataKind, EndpointId, Timestamp};
use tracing::{debug, info, warn};

/// Identity of one round, as queued by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRoundContext {
    /// Kind being fetched.
    pub kind: DataKind,
    /// Watermark the round fetches from.
    pub watermark: Timestamp,
    /// 1-based round number for this kind.
    pub round_index: u32,
}

impl FetchRoundContext {
    /// First round for `kind`.
    pub fn new(kind: DataKind, watermark: Timestamp) -> Self {
        Self {
            kind,
            watermark,
            round_index: 1,
        }
    }

    /// The next round for the same kind, starting at `watermark`.
    pub fn follow_up(&self, watermark: Timestamp) -> Self {
        Self {
            kind: self.kind,
            watermark,
            round_index: self.round_index.saturating_add(1),
        }
    }
}

/// Round state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Not started.
    Idle,
    /// Start request sent, waiting for the device's metadata.
    AwaitingMetadata,
    /// Receiving chunks.
    Streaming,
    /// Payload complete, checking integrity and decoding.
    Verifying,
    /// Ack sent, waiting for the device to confirm it.
    Acknowledging,
    /// Finished successfully.
    Done,
    /// Finished without handing off data.
    Aborted,
}

/// Input to a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    /// Begin the round.
    Start,
    /// Bytes arrived from the device.
    Received {
        /// Endpoint they arrived on.
        endpoint: EndpointId,
        /// Raw bytes.
        bytes: Vec<u8>,
    },
    /// Result of a [`RoundAction::Decode`].
    Decoded(Result<DecodedPayload, DecodeError>),
    /// A send failed or the link dropped.
    TransportFailed(String),
    /// No device event within the response timeout.
    Timeout,
}

/// Work the driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundAction {
    /// Write bytes to the device.
    Send {
        /// Target endpoint.
        endpoint: EndpointId,
        /// Bytes to write.
        bytes: Vec<u8>,
    },
    /// Run the sample decoder and feed the result back as [`RoundEvent::Decoded`].
    Decode {
        /// Verified payload.
        payload: VerifiedPayload,
        /// Timestamp of the first sample.
        start: Timestamp,
    },
    /// Report an event to the caller.
    Emit(SyncEvent),
    /// The round is over.
    Finish(RoundOutcome),
}

/// How to acknowledge a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    /// Device may delete the data.
    Drop,
    /// Device should keep the data; plain ack if the family cannot say so.
    Keep,
    /// Device must keep the data; no ack at all if the family cannot say so.
    MustKeep,
}

/// One fetch round.
pub struct FetchRound {
    ctx: FetchRoundContext,
    codec: Arc<dyn FamilyCodec>,
    state: RoundState,
    reassembler: ChunkReassembler,
    guard: SequenceGuard,
    verifier: IntegrityVerifier,
    expected_len: usize,
    start: Option<Timestamp>,
    payload: Option<Vec<u8>>,
    awaiting_decode: bool,
    pending: Option<RoundOutcome>,
    outcome: Option<RoundOutcome>,
}

impl FetchRound {
    /// Create an idle round.
    pub fn new(ctx: FetchRoundContext, codec: Arc<dyn FamilyCodec>) -> Self {
        let caps = codec.capabilities();
        let reassembler =
            ChunkReassembler::new(caps.overflow_policy).with_max_len(caps.max_payload_len);
        let verifier = IntegrityVerifier::new(caps.checksum_kind, caps.mismatch_policy);
        Self {
            ctx,
            codec,
            state: RoundState::Idle,
            reassembler,
            guard: SequenceGuard::new(),
            verifier,
            expected_len: 0,
            start: None,
            payload: None,
            awaiting_decode: false,
            pending: None,
            outcome: None,
        }
    }

    /// Round identity.
    pub fn context(&self) -> &FetchRoundContext {
        &self.ctx
    }

    /// Current state.
    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Payload length announced by the device.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// First-sample timestamp announced by the device.
    pub fn start_timestamp(&self) -> Option<Timestamp> {
        self.start
    }

    /// Final outcome, once finished.
    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    /// Whether the round reached `Done` or `Aborted`.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RoundState::Done | RoundState::Aborted)
    }

    /// Cancel the round. Sends nothing; a no-op once finished.
    pub fn abort(&mut self) -> Vec<RoundAction> {
        if self.is_finished() {
            return Vec::new();
        }
        self.finish(RoundOutcome::Aborted(AbortReason::Cancelled))
    }

    /// Process one event.
    pub fn handle(&mut self, event: RoundEvent) -> Vec<RoundAction> {
        if self.is_finished() {
            debug!(kind = %self.ctx.kind, ?event, "ignoring event on finished round");
            return Vec::new();
        }
        match event {
            RoundEvent::Start => self.on_start(),
            RoundEvent::Received {
                endpoint: EndpointId::Control,
                bytes,
            } => self.on_control(&bytes),
            RoundEvent::Received {
                endpoint: EndpointId::Data,
                bytes,
            } => self.on_data(&bytes),
            RoundEvent::Decoded(result) => self.on_decoded(result),
            RoundEvent::TransportFailed(reason) => {
                self.finish(RoundOutcome::Aborted(AbortReason::TransportFailure(reason)))
            }
            RoundEvent::Timeout => self.finish(RoundOutcome::Aborted(AbortReason::Timeout)),
        }
    }

    fn caps(&self) -> &FamilyCapabilities {
        self.codec.capabilities()
    }

    fn on_start(&mut self) -> Vec<RoundAction> {
        if self.state != RoundState::Idle {
            warn!(kind = %self.ctx.kind, state = ?self.state, "start on a running round ignored");
            return Vec::new();
        }
        let request = match self.codec.encode_start(self.ctx.kind, self.ctx.watermark) {
            Ok(bytes) => bytes,
            Err(e) => return self.violation(format!("cannot encode start request: {}", e)),
        };
        debug!(
            kind = %self.ctx.kind,
            round = self.ctx.round_index,
            since = %self.ctx.watermark,
            "starting fetch round"
        );
        self.state = RoundState::AwaitingMetadata;
        vec![
            RoundAction::Emit(SyncEvent::RoundStarted {
                kind: self.ctx.kind,
                round_index: self.ctx.round_index,
                since: self.ctx.watermark,
            }),
            RoundAction::Send {
                endpoint: EndpointId::Control,
                bytes: request,
            },
        ]
    }

    fn on_control(&mut self, bytes: &[u8]) -> Vec<RoundAction> {
        let message = match self.codec.decode_control(bytes) {
            Ok(message) => message,
            Err(e) => return self.violation(format!("malformed control frame: {}", e)),
        };

        match (self.state, message) {
            (_, ControlMessage::Unrecognized(raw)) => {
                warn!(kind = %self.ctx.kind, frame = %hex_dump(&raw, 16), "ignoring unrecognized control frame");
                Vec::new()
            }
            (RoundState::AwaitingMetadata, ControlMessage::Metadata { success: false, .. }) => {
                self.violation("device refused the start request".into())
            }
            (
                RoundState::AwaitingMetadata,
                ControlMessage::Metadata {
                    expected_len,
                    start,
                    ..
                },
            ) => self.on_metadata(expected_len as usize, start),
            (RoundState::Streaming, ControlMessage::TransferComplete { .. }) => {
                let received = self.reassembler.received();
                self.violation(format!(
                    "transfer ended after {} of {} bytes",
                    received, self.expected_len
                ))
            }
            (RoundState::Verifying, ControlMessage::TransferComplete { success: false, .. }) => {
                self.violation("device reported an unsuccessful transfer".into())
            }
            (RoundState::Verifying, ControlMessage::TransferComplete { checksum, .. })
                if !self.caps().checksum_embedded && !self.awaiting_decode =>
            {
                match self.payload.take() {
                    Some(payload) => self.verify(payload, checksum),
                    None => self.violation("transfer complete without payload".into()),
                }
            }
            (RoundState::Acknowledging, ControlMessage::AckConfirmed) => {
                match self.pending.take() {
                    Some(outcome) => self.finish(outcome),
                    None => self.violation("ack confirmed with no outcome pending".into()),
                }
            }
            (state, message) => {
                warn!(kind = %self.ctx.kind, ?state, ?message, "ignoring unexpected control message");
                Vec::new()
            }
        }
    }

    fn on_metadata(&mut self, expected_len: usize, start: Timestamp) -> Vec<RoundAction> {
        self.start = Some(start);
        self.expected_len = expected_len;

        if expected_len == 0 {
            info!(kind = %self.ctx.kind, since = %start, "no data to fetch");
            let outcome = RoundOutcome::Success {
                bytes_transferred: 0,
                new_watermark: self.ctx.watermark,
            };
            return self.acknowledge(Ack::Keep, outcome, Vec::new());
        }

        if let Err(e) = self.reassembler.begin(expected_len) {
            warn!(kind = %self.ctx.kind, bytes = expected_len, error = %e, "refusing metadata");
            return self.violation(e.to_string());
        }
        self.guard.reset(INITIAL_COUNTER);
        self.state = RoundState::Streaming;
        info!(kind = %self.ctx.kind, bytes = expected_len, since = %start, "will transfer");

        vec![RoundAction::Send {
            endpoint: EndpointId::Control,
            bytes: self.codec.encode_stream_request(),
        }]
    }

    fn on_data(&mut self, bytes: &[u8]) -> Vec<RoundAction> {
        if self.state != RoundState::Streaming {
            warn!(
                kind = %self.ctx.kind,
                state = ?self.state,
                len = bytes.len(),
                "ignoring data chunk: no reassembly in progress"
            );
            return Vec::new();
        }

        let chunk = match self.codec.split_chunk(bytes) {
            Ok(chunk) => chunk,
            Err(e) => return self.violation(format!("malformed data chunk: {}", e)),
        };

        if self.caps().chunk_counter_present {
            if let Some(counter) = chunk.sequence {
                let expected = self.guard.next();
                if !self.guard.expect(counter) {
                    warn!(kind = %self.ctx.kind, expected, got = counter, "invalid chunk counter");
                    return self.finish(RoundOutcome::Aborted(AbortReason::SequenceMismatch {
                        expected,
                        got: counter,
                    }));
                }
            }
        }

        match self.reassembler.append(&chunk.payload) {
            Ok(AppendResult::Incomplete { received, expected }) => {
                vec![self.progress(received, expected)]
            }
            Ok(AppendResult::Complete(payload)) => {
                let mut actions = vec![self.progress(self.expected_len, self.expected_len)];
                self.state = RoundState::Verifying;
                debug!(kind = %self.ctx.kind, bytes = payload.len(), "payload complete");

                if self.caps().checksum_embedded {
                    match self.verifier.split_embedded(payload) {
                        Ok((payload, checksum)) => actions.extend(self.verify(payload, checksum)),
                        Err(e) => actions.extend(self.violation(format!("no embedded checksum: {}", e))),
                    }
                } else {
                    self.payload = Some(payload);
                }
                actions
            }
            Ok(AppendResult::Overflow { expected, received }) => self.violation(format!(
                "payload overflow: {} bytes for {} declared",
                received, expected
            )),
            Err(e) => {
                warn!(kind = %self.ctx.kind, "ignoring data chunk: {}", e);
                Vec::new()
            }
        }
    }

    fn verify(&mut self, payload: Vec<u8>, checksum: Option<u32>) -> Vec<RoundAction> {
        if self.verifier.verify(&payload, checksum) {
            self.awaiting_decode = true;
            return vec![RoundAction::Decode {
                payload: VerifiedPayload {
                    bytes: payload,
                    checksum_valid: true,
                },
                start: self.start.unwrap_or(self.ctx.watermark),
            }];
        }

        warn!(
            kind = %self.ctx.kind,
            policy = ?self.verifier.policy(),
            "payload checksum mismatch"
        );
        match self.verifier.policy() {
            MismatchPolicy::Abort => self.finish(RoundOutcome::Aborted(
                AbortReason::ChecksumMismatch { retained: false },
            )),
            MismatchPolicy::RetainOnDevice => {
                let retained = self.caps().supports_retain_flag;
                let outcome =
                    RoundOutcome::Aborted(AbortReason::ChecksumMismatch { retained });
                self.acknowledge(Ack::MustKeep, outcome, Vec::new())
            }
        }
    }

    fn on_decoded(&mut self, result: Result<DecodedPayload, DecodeError>) -> Vec<RoundAction> {
        if self.state != RoundState::Verifying || !self.awaiting_decode {
            warn!(kind = %self.ctx.kind, state = ?self.state, "unexpected decode result ignored");
            return Vec::new();
        }
        self.awaiting_decode = false;

        match result {
            Ok(decoded) => {
                let start = self.start.unwrap_or(self.ctx.watermark);
                let new_watermark = start.saturating_add(decoded.span);
                debug!(
                    kind = %self.ctx.kind,
                    samples = decoded.samples,
                    until = %new_watermark,
                    "payload decoded"
                );
                let ack = if self.caps().keep_data_on_device {
                    Ack::MustKeep
                } else {
                    Ack::Drop
                };
                let outcome = RoundOutcome::Success {
                    bytes_transferred: self.expected_len,
                    new_watermark,
                };
                self.acknowledge(ack, outcome, Vec::new())
            }
            Err(e) => {
                warn!(kind = %self.ctx.kind, error = %e, "decoder rejected payload");
                let outcome = RoundOutcome::Aborted(AbortReason::DecodeError(e.to_string()));
                self.acknowledge(Ack::MustKeep, outcome, Vec::new())
            }
        }
    }

    fn acknowledge(
        &mut self,
        ack: Ack,
        outcome: RoundOutcome,
        mut actions: Vec<RoundAction>,
    ) -> Vec<RoundAction> {
        let supports_retain = self.caps().supports_retain_flag;
        if ack == Ack::MustKeep && !supports_retain {
            debug!(kind = %self.ctx.kind, "family cannot ask to keep data, not acknowledging");
            actions.extend(self.finish(outcome));
            return actions;
        }

        let retain = ack != Ack::Drop;
        debug!(kind = %self.ctx.kind, retain, "sending ack");
        actions.push(RoundAction::Send {
            endpoint: EndpointId::Control,
            bytes: self.codec.encode_ack(retain),
        });

        if self.caps().ack_confirmation {
            self.state = RoundState::Acknowledging;
            self.pending = Some(outcome);
        } else {
            actions.extend(self.finish(outcome));
        }
        actions
    }

    fn progress(&self, bytes_so_far: usize, bytes_expected: usize) -> RoundAction {
        RoundAction::Emit(SyncEvent::RoundProgress {
            kind: self.ctx.kind,
            bytes_so_far,
            bytes_expected,
        })
    }

    fn violation(&mut self, reason: String) -> Vec<RoundAction> {
        self.finish(RoundOutcome::Aborted(AbortReason::ProtocolViolation(reason)))
    }

    fn finish(&mut self, outcome: RoundOutcome) -> Vec<RoundAction> {
        self.state = if outcome.is_success() {
            RoundState::Done
        } else {
            RoundState::Aborted
        };
        self.reassembler.reset();
        self.payload = None;
        self.pending = None;
        self.awaiting_decode = false;

        match &outcome {
            RoundOutcome::Aborted(reason) => {
                warn!(kind = %self.ctx.kind, round = self.ctx.round_index, %reason, "round aborted")
            }
            _ => info!(kind = %self.ctx.kind, round = self.ctx.round_index, ?outcome, "round finished"),
        }
        self.outcome = Some(outcome.clone());
        vec![RoundAction::Finish(outcome)]
    }
}

impl std::fmt::Debug for FetchRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRound")
            .field("ctx", &self.ctx)
            .field("family", &self.codec.name())
            .field("state", &self.state)
            .field("expected_len", &self.expected_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{Chunk, HuamiCodec};
    use crate::ProtocolError;
    use std::time::Duration;
    use sync_types::checksum::{crc16, crc32, ChecksumKind};
    use sync_types::{huami, WireError};

    const SINCE: Timestamp = Timestamp::from_secs(1_700_000_000);
    const DEVICE_START: Timestamp = Timestamp::from_secs(1_700_000_060);

    fn ctx(kind: DataKind) -> FetchRoundContext {
        FetchRoundContext::new(kind, SINCE)
    }

    fn control(bytes: Vec<u8>) -> RoundEvent {
        RoundEvent::Received {
            endpoint: EndpointId::Control,
            bytes,
        }
    }

    fn data(bytes: Vec<u8>) -> RoundEvent {
        RoundEvent::Received {
            endpoint: EndpointId::Data,
            bytes,
        }
    }

    fn sends(actions: &[RoundAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                RoundAction::Send { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    fn finished(actions: &[RoundAction]) -> Option<RoundOutcome> {
        actions.iter().find_map(|a| match a {
            RoundAction::Finish(outcome) => Some(outcome.clone()),
            _ => None,
        })
    }

    fn decode_request(actions: &[RoundAction]) -> Option<VerifiedPayload> {
        actions.iter().find_map(|a| match a {
            RoundAction::Decode { payload, .. } => Some(payload.clone()),
            _ => None,
        })
    }

    fn metadata(len: u32) -> RoundEvent {
        control(huami::encode_start_response(true, len, DEVICE_START, 0).unwrap())
    }

    fn started(codec: Arc<dyn FamilyCodec>) -> FetchRound {
        let mut round = FetchRound::new(ctx(DataKind::Activity), codec);
        let actions = round.handle(RoundEvent::Start);
        assert_eq!(round.state(), RoundState::AwaitingMetadata);
        assert!(matches!(
            actions[0],
            RoundAction::Emit(SyncEvent::RoundStarted { round_index: 1, .. })
        ));
        round
    }

    /// Stream `payload` as 20-byte chunks with counters 0, 1, 2, ...
    fn stream(round: &mut FetchRound, payload: &[u8]) -> Vec<RoundAction> {
        let mut actions = Vec::new();
        for (i, piece) in payload.chunks(20).enumerate() {
            actions.extend(round.handle(data(huami::encode_data_chunk(i as u8, piece))));
        }
        actions
    }

    #[test]
    fn zero_length_metadata_succeeds_without_data() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));

        let actions = round.handle(metadata(0));
        assert_eq!(sends(&actions), vec![vec![0x03, 0x09]]);
        assert_eq!(finished(&actions), None);
        assert_eq!(round.state(), RoundState::Acknowledging);

        let actions = round.handle(control(huami::encode_ack_response()));
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Success {
                bytes_transferred: 0,
                new_watermark: SINCE,
            })
        );
        assert_eq!(round.state(), RoundState::Done);
    }

    #[test]
    fn happy_path_three_chunks() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        let payload: Vec<u8> = (0..60).collect();

        let actions = round.handle(metadata(60));
        assert_eq!(sends(&actions), vec![vec![0x02]]);
        assert_eq!(round.state(), RoundState::Streaming);

        let actions = stream(&mut round, &payload);
        let progress: Vec<usize> = actions
            .iter()
            .filter_map(|a| match a {
                RoundAction::Emit(SyncEvent::RoundProgress { bytes_so_far, .. }) => {
                    Some(*bytes_so_far)
                }
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![20, 40, 60]);
        assert_eq!(round.state(), RoundState::Verifying);

        let actions = round.handle(control(huami::encode_fetch_response(
            true,
            Some(crc32(&payload)),
        )));
        let verified = decode_request(&actions).expect("decode requested");
        assert_eq!(verified.bytes, payload);
        assert!(verified.checksum_valid);

        let actions = round.handle(RoundEvent::Decoded(Ok(DecodedPayload {
            samples: 60,
            span: Duration::from_secs(3600),
        })));
        // Drop on device.
        assert_eq!(sends(&actions), vec![vec![0x03, 0x01]]);
        assert_eq!(round.state(), RoundState::Acknowledging);

        let actions = round.handle(control(huami::encode_ack_response()));
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Success {
                bytes_transferred: 60,
                new_watermark: DEVICE_START.saturating_add(Duration::from_secs(3600)),
            })
        );
    }

    #[test]
    fn skipped_counter_aborts() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        round.handle(metadata(60));

        assert!(round.handle(data(huami::encode_data_chunk(0, &[0; 20]))).len() == 1);
        let actions = round.handle(data(huami::encode_data_chunk(2, &[0; 20])));

        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::SequenceMismatch {
                expected: 1,
                got: 2
            }))
        );
        assert!(sends(&actions).is_empty());
        assert_eq!(round.state(), RoundState::Aborted);
    }

    #[test]
    fn checksum_mismatch_retains_on_device() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        let payload = [7u8; 40];
        round.handle(metadata(40));
        stream(&mut round, &payload);

        let actions = round.handle(control(huami::encode_fetch_response(
            true,
            Some(crc32(&payload) ^ 1),
        )));
        assert!(decode_request(&actions).is_none());
        assert_eq!(sends(&actions), vec![vec![0x03, 0x09]]);

        let actions = round.handle(control(huami::encode_ack_response()));
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ChecksumMismatch {
                retained: true
            }))
        );
    }

    #[test]
    fn checksum_mismatch_abort_policy_sends_nothing() {
        let mut caps = FamilyCapabilities::zepp_os();
        caps.mismatch_policy = MismatchPolicy::Abort;
        let codec = HuamiCodec::zepp_os().with_capabilities(caps);
        let mut round = started(Arc::new(codec));
        round.handle(metadata(20));
        stream(&mut round, &[1; 20]);

        let actions = round.handle(control(huami::encode_fetch_response(true, Some(0))));
        assert!(sends(&actions).is_empty());
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ChecksumMismatch {
                retained: false
            }))
        );
    }

    #[test]
    fn decode_failure_retains_and_aborts() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        round.handle(metadata(20));
        stream(&mut round, &[1; 20]);
        round.handle(control(huami::encode_fetch_response(true, None)));

        let actions = round.handle(RoundEvent::Decoded(Err(DecodeError::Invalid(
            "bad record".into(),
        ))));
        assert_eq!(sends(&actions), vec![vec![0x03, 0x09]]);

        let actions = round.handle(control(huami::encode_ack_response()));
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::DecodeError(_)))
        ));
    }

    #[test]
    fn classic_decode_failure_skips_ack() {
        let mut round = started(Arc::new(HuamiCodec::classic()));
        round.handle(metadata(20));
        stream(&mut round, &[1; 20]);
        round.handle(control(huami::encode_fetch_response(true, None)));

        let actions = round.handle(RoundEvent::Decoded(Err(DecodeError::Invalid(
            "bad record".into(),
        ))));
        assert!(sends(&actions).is_empty());
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::DecodeError(_)))
        ));
    }

    #[test]
    fn keep_data_preference_forces_retain() {
        let mut caps = FamilyCapabilities::zepp_os();
        caps.keep_data_on_device = true;
        let mut round = started(Arc::new(HuamiCodec::zepp_os().with_capabilities(caps)));
        round.handle(metadata(20));
        stream(&mut round, &[1; 20]);
        round.handle(control(huami::encode_fetch_response(true, None)));

        let actions = round.handle(RoundEvent::Decoded(Ok(DecodedPayload {
            samples: 1,
            span: Duration::from_secs(60),
        })));
        assert_eq!(sends(&actions), vec![vec![0x03, 0x09]]);
    }

    #[test]
    fn early_transfer_complete_is_a_violation() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        round.handle(metadata(60));
        stream(&mut round, &[0; 20]);

        let actions = round.handle(control(huami::encode_fetch_response(true, None)));
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn overflow_is_a_violation() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        round.handle(metadata(30));
        stream(&mut round, &[0; 20]);

        let actions = round.handle(data(huami::encode_data_chunk(1, &[0; 20])));
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn oversized_metadata_is_a_violation() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        let actions = round.handle(metadata(u32::MAX));

        assert_eq!(round.state(), RoundState::Aborted);
        assert!(sends(&actions).is_empty());
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn payload_limit_follows_capabilities() {
        let mut caps = FamilyCapabilities::zepp_os();
        caps.max_payload_len = 40;
        let codec = Arc::new(HuamiCodec::zepp_os().with_capabilities(caps));

        let mut round = started(codec.clone());
        let actions = round.handle(metadata(41));
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ProtocolViolation(_)))
        ));

        let mut round = started(codec);
        round.handle(metadata(40));
        assert_eq!(round.state(), RoundState::Streaming);
    }

    #[test]
    fn refused_start_is_a_violation() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        let actions = round.handle(control(vec![0x10, 0x01, 0x02]));
        assert!(matches!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn stray_input_is_ignored() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));

        // Data before metadata.
        assert!(round.handle(data(vec![0, 1, 2])).is_empty());
        // Frame that is not a response.
        assert!(round.handle(control(vec![0x01, 0x02, 0x03])).is_empty());
        // Ack confirmation out of place.
        assert!(round.handle(control(huami::encode_ack_response())).is_empty());

        assert_eq!(round.state(), RoundState::AwaitingMetadata);
    }

    #[test]
    fn timeout_and_transport_failure_abort_silently() {
        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        round.handle(metadata(60));
        let actions = round.handle(RoundEvent::Timeout);
        assert_eq!(actions, vec![RoundAction::Finish(RoundOutcome::Aborted(AbortReason::Timeout))]);

        let mut round = started(Arc::new(HuamiCodec::zepp_os()));
        let actions = round.handle(RoundEvent::TransportFailed("link lost".into()));
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::TransportFailure(
                "link lost".into()
            )))
        );
        assert!(sends(&actions).is_empty());
    }

    #[test]
    fn abort_from_any_state_is_safe() {
        let mut idle = FetchRound::new(ctx(DataKind::Activity), Arc::new(HuamiCodec::zepp_os()));
        assert_eq!(
            idle.abort(),
            vec![RoundAction::Finish(RoundOutcome::Aborted(AbortReason::Cancelled))]
        );
        assert!(idle.abort().is_empty());
        assert!(idle.handle(RoundEvent::Start).is_empty());

        let mut streaming = started(Arc::new(HuamiCodec::zepp_os()));
        streaming.handle(metadata(60));
        let actions = streaming.abort();
        assert!(sends(&actions).is_empty());
        assert_eq!(streaming.state(), RoundState::Aborted);
        assert_eq!(
            streaming.outcome(),
            Some(&RoundOutcome::Aborted(AbortReason::Cancelled))
        );
    }

    /// A family without counters that embeds a CRC-16 and never confirms acks.
    ///
    /// Control frames: `[0xA0, len u32le, start i64le]` metadata, `[0xAC]` ack.
    struct EmbeddedCrcCodec {
        caps: FamilyCapabilities,
    }

    impl EmbeddedCrcCodec {
        fn new() -> Self {
            Self {
                caps: FamilyCapabilities {
                    chunk_counter_present: false,
                    checksum_kind: ChecksumKind::Crc16,
                    checksum_embedded: true,
                    mismatch_policy: MismatchPolicy::Abort,
                    supports_retain_flag: false,
                    ack_confirmation: false,
                    ..FamilyCapabilities::huami()
                },
            }
        }

        fn metadata(len: u32) -> Vec<u8> {
            let mut out = vec![0xA0];
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&DEVICE_START.millis().to_le_bytes());
            out
        }
    }

    impl FamilyCodec for EmbeddedCrcCodec {
        fn name(&self) -> &'static str {
            "embedded-crc"
        }
        fn capabilities(&self) -> &FamilyCapabilities {
            &self.caps
        }
        fn supports(&self, _kind: DataKind) -> bool {
            true
        }
        fn encode_start(&self, _: DataKind, _: Timestamp) -> Result<Vec<u8>, ProtocolError> {
            Ok(vec![0x5A])
        }
        fn encode_stream_request(&self) -> Vec<u8> {
            vec![0x5B]
        }
        fn encode_ack(&self, _retain: bool) -> Vec<u8> {
            vec![0xAC]
        }
        fn decode_control(&self, bytes: &[u8]) -> Result<ControlMessage, WireError> {
            if bytes.len() == 13 && bytes[0] == 0xA0 {
                let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&bytes[5..13]);
                Ok(ControlMessage::Metadata {
                    success: true,
                    expected_len: len,
                    start: Timestamp::from_millis(i64::from_le_bytes(ts)),
                })
            } else {
                Ok(ControlMessage::Unrecognized(bytes.to_vec()))
            }
        }
        fn split_chunk(&self, bytes: &[u8]) -> Result<Chunk, WireError> {
            Ok(Chunk {
                sequence: None,
                payload: bytes.to_vec(),
            })
        }
    }

    #[test]
    fn embedded_crc16_without_counters() {
        let mut round = FetchRound::new(ctx(DataKind::Hrv), Arc::new(EmbeddedCrcCodec::new()));
        assert_eq!(sends(&round.handle(RoundEvent::Start)), vec![vec![0x5A]]);

        let body = b"123456789".to_vec();
        let mut framed = body.clone();
        framed.extend_from_slice(&crc16(&body).to_le_bytes());

        let actions = round.handle(control(EmbeddedCrcCodec::metadata(framed.len() as u32)));
        assert_eq!(sends(&actions), vec![vec![0x5B]]);

        round.handle(data(framed[..5].to_vec()));
        let actions = round.handle(data(framed[5..].to_vec()));
        let verified = decode_request(&actions).expect("decode requested");
        assert_eq!(verified.bytes, body);

        // No ack confirmation: finishes as soon as the ack is sent.
        let actions = round.handle(RoundEvent::Decoded(Ok(DecodedPayload {
            samples: 9,
            span: Duration::from_secs(9),
        })));
        assert_eq!(sends(&actions), vec![vec![0xAC]]);
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Success {
                bytes_transferred: 11,
                new_watermark: DEVICE_START.saturating_add(Duration::from_secs(9)),
            })
        );
    }

    #[test]
    fn embedded_crc16_zero_length_finishes_immediately() {
        let mut round = FetchRound::new(ctx(DataKind::Hrv), Arc::new(EmbeddedCrcCodec::new()));
        round.handle(RoundEvent::Start);

        let actions = round.handle(control(EmbeddedCrcCodec::metadata(0)));
        assert_eq!(sends(&actions), vec![vec![0xAC]]);
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Success {
                bytes_transferred: 0,
                new_watermark: SINCE,
            })
        );
    }

    #[test]
    fn embedded_crc16_mismatch_aborts() {
        let mut round = FetchRound::new(ctx(DataKind::Hrv), Arc::new(EmbeddedCrcCodec::new()));
        round.handle(RoundEvent::Start);
        round.handle(control(EmbeddedCrcCodec::metadata(6)));

        let actions = round.handle(data(vec![1, 2, 3, 4, 0xFF, 0xFF]));
        assert_eq!(
            finished(&actions),
            Some(RoundOutcome::Aborted(AbortReason::ChecksumMismatch {
                retained: false
            }))
        );
    }
}
