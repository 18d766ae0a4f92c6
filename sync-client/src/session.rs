//! SyncSession - drives history fetch rounds against one device.
//!
//! The session owns the transport, the watermark store and the sample
//! decoder. Protocol logic lives in the pure state machines of sync-core;
//! the session interprets their actions to perform actual I/O.
//!
//! ```text
//! Transport ─recv─▶ SyncSession ─RoundEvent─▶ FetchRound (pure)
//!     ▲                  │  ◀──RoundAction───────┘
//!     └──────send────────┤
//!                        ├─decode─▶ SampleDecoder
//!                        └─finish─▶ RoundScheduler ─▶ WatermarkStore
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::{FixedIntervalDecoder, JsonWatermarkStore, SyncSession};
//! use sync_core::HuamiCodec;
//!
//! let store = JsonWatermarkStore::open("state.json")?;
//! let mut session = SyncSession::new(transport, store, FixedIntervalDecoder::new(),
//!     Arc::new(HuamiCodec::zepp_os()));
//! let mut events = session.subscribe();
//! let report = session.sync(&[DataKind::Activity], since).await?;
//! ```

use crate::transport::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    AbortReason, FamilyCodec, FetchRound, FetchRoundContext, RoundAction, RoundEvent, RoundOutcome,
    RoundScheduler, SampleDecoder, SyncEvent, WatermarkError, WatermarkStore,
};
use sync_types::{DataKind, Timestamp};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Session errors.
///
/// Per-round failures never show up here; they are reported as
/// [`RoundOutcome::Aborted`] in the [`SyncReport`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport error outside a round.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Watermark store error.
    #[error("watermark store error: {0}")]
    Store(#[from] WatermarkError),
}

/// One finished round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    /// Kind fetched.
    pub kind: DataKind,
    /// 1-based round number for the kind.
    pub round_index: u32,
    /// Watermark the round started from.
    pub since: Timestamp,
    /// Payload bytes handed to the decoder.
    pub bytes_transferred: usize,
    /// Outcome after scheduling.
    pub outcome: RoundOutcome,
}

/// Result of [`SyncSession::sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Every round, in the order they ran.
    pub rounds: Vec<RoundRecord>,
    /// Kinds whose last round succeeded, in sync order.
    pub completed: Vec<DataKind>,
    /// Requested kinds the device family cannot fetch.
    pub unsupported: Vec<DataKind>,
}

impl SyncReport {
    /// Total payload bytes of successful rounds.
    pub fn bytes_transferred(&self) -> usize {
        self.rounds.iter().map(|r| r.bytes_transferred).sum()
    }
}

/// Cancels a running [`SyncSession::sync`] from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Abort the in-flight round and stop the sync.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Drives fetch rounds for one device.
pub struct SyncSession<T: Transport, S: WatermarkStore, D: SampleDecoder> {
    transport: T,
    store: S,
    decoder: D,
    codec: Arc<dyn FamilyCodec>,
    response_timeout: Duration,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

enum Next {
    Event(RoundEvent),
    Cancelled,
}

impl<T: Transport, S: WatermarkStore, D: SampleDecoder> SyncSession<T, S, D> {
    /// Create a session. The transport must already be connected.
    pub fn new(transport: T, store: S, decoder: D, codec: Arc<dyn FamilyCodec>) -> Self {
        let response_timeout = codec.capabilities().response_timeout;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            transport,
            store,
            decoder,
            codec,
            response_timeout,
            events: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// Override the family's response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Send events to an existing channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Create an event channel and return its receiving end.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// A handle that cancels the running sync.
    ///
    /// Each call to [`sync`](Self::sync) starts uncancelled.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The watermark store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The decoder.
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Mutable access to the decoder, e.g. to take decoded samples.
    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    /// Give back the owned parts.
    pub fn into_parts(self) -> (T, S, D) {
        (self.transport, self.store, self.decoder)
    }

    /// Fetch every kind in `kinds`, starting from each kind's stored
    /// watermark or `default_since`.
    ///
    /// Runs one round at a time until the scheduler's queue is empty, then
    /// emits [`SyncEvent::SyncFinished`].
    pub async fn sync(
        &mut self,
        kinds: &[DataKind],
        default_since: Timestamp,
    ) -> Result<SyncReport, SessionError> {
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        self.cancel_tx.send_replace(false);
        self.cancel_rx.borrow_and_update();

        let mut report = SyncReport::default();
        let mut supported = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            if self.codec.supports(kind) {
                supported.push(kind);
            } else {
                warn!(%kind, family = self.codec.name(), "kind not supported, skipping");
                report.unsupported.push(kind);
            }
        }

        let mut scheduler = RoundScheduler::from_capabilities(self.codec.capabilities());
        scheduler.plan(&supported, &self.store, default_since);
        info!(
            family = self.codec.name(),
            rounds = supported.len(),
            "starting sync"
        );

        while let Some(ctx) = scheduler.next_round() {
            let outcome = self.run_round(ctx).await;
            let bytes_transferred = match outcome {
                RoundOutcome::Success {
                    bytes_transferred, ..
                } => bytes_transferred,
                _ => 0,
            };
            let outcome =
                scheduler.on_round_finished(&ctx, outcome, &mut self.store, Timestamp::now())?;
            self.emit(SyncEvent::RoundFinished {
                kind: ctx.kind,
                outcome: outcome.clone(),
            });
            report.rounds.push(RoundRecord {
                kind: ctx.kind,
                round_index: ctx.round_index,
                since: ctx.watermark,
                bytes_transferred,
                outcome,
            });
        }

        report.completed = scheduler.completed().to_vec();
        info!(
            completed = report.completed.len(),
            rounds = report.rounds.len(),
            bytes = report.bytes_transferred(),
            "sync finished"
        );
        self.emit(SyncEvent::SyncFinished {
            data_kinds_completed: report.completed.clone(),
        });
        Ok(report)
    }

    async fn run_round(&mut self, ctx: FetchRoundContext) -> RoundOutcome {
        let mut round = FetchRound::new(ctx, Arc::clone(&self.codec));
        let mut actions: VecDeque<RoundAction> = round.handle(RoundEvent::Start).into();

        loop {
            while let Some(action) = actions.pop_front() {
                match action {
                    RoundAction::Send { endpoint, bytes } => {
                        debug!(kind = %ctx.kind, ?endpoint, len = bytes.len(), "sending");
                        if let Err(e) = self.transport.send(endpoint, &bytes).await {
                            warn!(kind = %ctx.kind, error = %e, "send failed");
                            return fail(&mut round, e.to_string());
                        }
                    }
                    RoundAction::Decode { payload, start } => {
                        let result = self.decoder.decode(ctx.kind, &payload, start);
                        actions.extend(round.handle(RoundEvent::Decoded(result)));
                    }
                    RoundAction::Emit(event) => self.emit(event),
                    RoundAction::Finish(outcome) => return outcome,
                }
            }

            match self.next_event().await {
                Next::Event(event) => actions.extend(round.handle(event)),
                Next::Cancelled => {
                    info!(kind = %ctx.kind, "sync cancelled");
                    actions.extend(round.abort());
                }
            }
        }
    }

    async fn next_event(&mut self) -> Next {
        let timeout = self.response_timeout;
        let recv = tokio::time::timeout(timeout, self.transport.recv());
        let cancel_rx = &mut self.cancel_rx;
        tokio::select! {
            result = recv => match result {
                Ok(Ok((endpoint, bytes))) => Next::Event(RoundEvent::Received { endpoint, bytes }),
                Ok(Err(e)) => {
                    warn!(error = %e, "receive failed");
                    Next::Event(RoundEvent::TransportFailed(e.to_string()))
                }
                Err(_) => {
                    warn!(?timeout, "no response from device");
                    Next::Event(RoundEvent::Timeout)
                }
            },
            _ = cancelled(cancel_rx) => Next::Cancelled,
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = events.send(event);
        }
    }
}

/// End a round after a failed send.
fn fail(round: &mut FetchRound, reason: String) -> RoundOutcome {
    let failed = RoundOutcome::Aborted(AbortReason::TransportFailure(reason.clone()));
    round
        .handle(RoundEvent::TransportFailed(reason))
        .into_iter()
        .find_map(|a| match a {
            RoundAction::Finish(outcome) => Some(outcome),
            _ => None,
        })
        .unwrap_or(failed)
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
