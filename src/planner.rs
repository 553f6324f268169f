//! Context-Windowed Recompute Planner
//!
//! Turns a watermark into the slice of upstream rows to recompute. The slice
//! starts `lookback` rows before the first new row so windowed computations
//! are warmed up, and the rows to persist end `lookahead` rows before the
//! upstream end so forward-looking labels are only finalized once their
//! whole future window exists.
//!
//! All ranges index into the upstream dataset's records.

use crate::types::EntityDataset;
use crate::watermark::Watermark;
use chrono::NaiveDate;
use std::ops::Range;

/// Kind of recomputation chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Nothing to do
    Noop,
    /// Recompute new rows from a context slice and append them
    Incremental,
    /// Recompute everything and replace the downstream dataset
    Full,
}

/// Rows to feed into a recompute and rows to keep afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputePlan {
    pub mode: PlanMode,
    /// Upstream rows handed to the computation
    pub input: Range<usize>,
    /// Upstream rows whose results are persisted; starts at the cut marker
    pub persist: Range<usize>,
}

impl RecomputePlan {
    fn noop(len: usize) -> Self {
        Self {
            mode: PlanMode::Noop,
            input: len..len,
            persist: len..len,
        }
    }

    /// First row to persist; rows before it in `input` are context only
    pub fn cut(&self) -> usize {
        self.persist.start
    }

    /// Rows replayed only to warm up windowed computations
    pub fn context_len(&self) -> usize {
        self.persist.start - self.input.start
    }

    /// Rows that will be persisted
    pub fn persist_len(&self) -> usize {
        self.persist.len()
    }

    /// New rows that cannot be finalized yet for lack of future data
    pub fn pending_len(&self) -> usize {
        self.input.end - self.persist.end
    }

    /// Offset of the persisted rows inside the input slice
    pub fn persist_in_input(&self) -> Range<usize> {
        (self.persist.start - self.input.start)..(self.persist.end - self.input.start)
    }

    pub fn is_noop(&self) -> bool {
        self.mode == PlanMode::Noop
    }
}

/// Planner for one stage transition
#[derive(Debug, Clone, Copy)]
pub struct RecomputePlanner {
    lookback: usize,
    lookahead: usize,
    keep_warm_up: bool,
}

impl RecomputePlanner {
    /// `lookback`: prior rows windowed computations need.
    /// `lookahead`: future rows a row needs before it can be finalized.
    pub fn new(lookback: usize, lookahead: usize) -> Self {
        Self {
            lookback,
            lookahead,
            keep_warm_up: false,
        }
    }

    /// Persist the first `lookback` rows on a full recompute too. For
    /// stages whose rows do not depend on prior rows, where the lookback is
    /// replay context only.
    pub fn keeping_warm_up(mut self) -> Self {
        self.keep_warm_up = true;
        self
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Plan the recompute of `upstream` given the resolved watermark and the
    /// downstream's last persisted date.
    pub fn plan(
        &self,
        watermark: Watermark,
        upstream: &EntityDataset,
        downstream_last: Option<NaiveDate>,
    ) -> RecomputePlan {
        let len = upstream.len();
        match (watermark, downstream_last) {
            (Watermark::UpToDate, _) | (Watermark::StaleBy(0), _) => RecomputePlan::noop(len),
            (Watermark::StaleBy(_), Some(last)) => {
                let cut = upstream.position_after(last);
                if cut < self.lookback || len <= self.lookahead {
                    log::debug!(
                        "{}: {} context rows available, {} needed; falling back to full recompute",
                        upstream.entity,
                        cut,
                        self.lookback
                    );
                    return self.full(len);
                }
                RecomputePlan {
                    mode: PlanMode::Incremental,
                    input: (cut - self.lookback)..len,
                    persist: cut..self.finalized_end(cut, len),
                }
            }
            (Watermark::StaleBy(_), None) | (Watermark::NoDownstreamData, _) => self.full(len),
        }
    }

    fn full(&self, len: usize) -> RecomputePlan {
        let cut = if self.keep_warm_up {
            0
        } else {
            self.lookback.min(len)
        };
        RecomputePlan {
            mode: PlanMode::Full,
            input: 0..len,
            persist: cut..self.finalized_end(cut, len),
        }
    }

    fn finalized_end(&self, cut: usize, len: usize) -> usize {
        len.saturating_sub(self.lookahead).max(cut)
    }
}
