//! Round scheduling across data kinds.
//!
//! The scheduler owns a queue of [`FetchRoundContext`]s. Kinds are queued in
//! priority order; follow-up rounds for a kind are inserted at the head so a
//! kind is fully drained before the next one starts.

use crate::event::{AbortReason, RoundOutcome};
use crate::family::FamilyCapabilities;
use crate::round::FetchRoundContext;
use crate::watermark::{advance, WatermarkError, WatermarkStore};
use std::collections::VecDeque;
use std::time::Duration;
use sync_types::{DataKind, Timestamp};
use tracing::{debug, info, warn};

/// Decides follow-up rounds and persists watermarks.
#[derive(Debug, Clone)]
pub struct RoundScheduler {
    max_rounds: u32,
    min_round_progress: Duration,
    queue: VecDeque<FetchRoundContext>,
    completed: Vec<DataKind>,
}

impl RoundScheduler {
    /// Create a scheduler with explicit limits.
    pub fn new(max_rounds: u32, min_round_progress: Duration) -> Self {
        Self {
            max_rounds,
            min_round_progress,
            queue: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    /// Create a scheduler with a family's limits.
    pub fn from_capabilities(caps: &FamilyCapabilities) -> Self {
        Self::new(caps.max_rounds, caps.min_round_progress)
    }

    /// Queue the first round of every kind in priority order.
    ///
    /// Each round starts at the kind's stored watermark, or `default_since`
    /// if none was stored. Duplicate kinds are queued once.
    pub fn plan(
        &mut self,
        kinds: &[DataKind],
        store: &dyn WatermarkStore,
        default_since: Timestamp,
    ) {
        for kind in DataKind::PRIORITY {
            if !kinds.contains(&kind) {
                continue;
            }
            let since = store.get(kind).unwrap_or(default_since);
            debug!(%kind, %since, "planned");
            self.queue.push_back(FetchRoundContext::new(kind, since));
        }
    }

    /// Take the next round to run.
    pub fn next_round(&mut self) -> Option<FetchRoundContext> {
        self.queue.pop_front()
    }

    /// Rounds still queued.
    pub fn queued(&self) -> impl Iterator<Item = &FetchRoundContext> {
        self.queue.iter()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Kinds whose last round succeeded, in completion order.
    pub fn completed(&self) -> &[DataKind] {
        &self.completed
    }

    /// Whether a successful round should be followed by another for the same kind.
    ///
    /// Pure: the same arguments always give the same answer.
    pub fn needs_another_round(
        &self,
        ctx: &FetchRoundContext,
        outcome: &RoundOutcome,
        now: Timestamp,
    ) -> bool {
        let new_watermark = match outcome {
            RoundOutcome::Success { new_watermark, .. }
            | RoundOutcome::NeedsAnotherRound { new_watermark } => *new_watermark,
            RoundOutcome::Aborted(_) => return false,
        };

        let progress = new_watermark.duration_since(ctx.watermark);
        if progress < self.min_round_progress {
            debug!(kind = %ctx.kind, ?progress, "round made too little progress, stopping");
            return false;
        }
        if ctx.round_index >= self.max_rounds {
            warn!(kind = %ctx.kind, rounds = ctx.round_index, "round limit reached, stopping");
            return false;
        }
        if new_watermark >= now {
            debug!(kind = %ctx.kind, %new_watermark, "caught up");
            return false;
        }
        info!(kind = %ctx.kind, %new_watermark, "watermark still behind, fetching again");
        true
    }

    /// Record a finished round.
    ///
    /// Persists the watermark of a successful round, queues any follow-up or
    /// retry at the head of the queue, and returns the outcome to report:
    /// a success that was followed up becomes
    /// [`RoundOutcome::NeedsAnotherRound`].
    pub fn on_round_finished(
        &mut self,
        ctx: &FetchRoundContext,
        outcome: RoundOutcome,
        store: &mut dyn WatermarkStore,
        now: Timestamp,
    ) -> Result<RoundOutcome, WatermarkError> {
        match outcome {
            RoundOutcome::Success {
                bytes_transferred,
                new_watermark,
            } => {
                advance(store, ctx.kind, new_watermark)?;
                let reported = RoundOutcome::Success {
                    bytes_transferred,
                    new_watermark,
                };
                if self.needs_another_round(ctx, &reported, now) {
                    self.queue.push_front(ctx.follow_up(new_watermark));
                    Ok(RoundOutcome::NeedsAnotherRound { new_watermark })
                } else {
                    self.completed.push(ctx.kind);
                    Ok(reported)
                }
            }
            RoundOutcome::NeedsAnotherRound { new_watermark } => {
                // Already scheduled by an earlier call; only persist.
                advance(store, ctx.kind, new_watermark)?;
                Ok(RoundOutcome::NeedsAnotherRound { new_watermark })
            }
            RoundOutcome::Aborted(reason) => {
                self.on_abort(ctx, &reason);
                Ok(RoundOutcome::Aborted(reason))
            }
        }
    }

    fn on_abort(&mut self, ctx: &FetchRoundContext, reason: &AbortReason) {
        match reason {
            AbortReason::SequenceMismatch { .. } | AbortReason::ChecksumMismatch { .. } => {
                if ctx.round_index < self.max_rounds {
                    info!(kind = %ctx.kind, %reason, "retrying from the same watermark");
                    self.queue.push_front(ctx.follow_up(ctx.watermark));
                } else {
                    warn!(kind = %ctx.kind, %reason, "retry budget exhausted");
                }
            }
            AbortReason::TransportFailure(_) | AbortReason::Cancelled => {
                warn!(kind = %ctx.kind, %reason, dropped = self.queue.len(), "ending sync");
                self.queue.clear();
            }
            AbortReason::ProtocolViolation(_)
            | AbortReason::DecodeError(_)
            | AbortReason::Timeout => {
                warn!(kind = %ctx.kind, %reason, "giving up on kind");
            }
        }
    }
}
