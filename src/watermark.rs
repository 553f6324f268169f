//! High-Water-Mark Resolver

use crate::error::{Result, StocknubError};
use crate::types::EntityDataset;
use std::fmt;

/// How far a downstream dataset lags its upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Nothing materialized downstream yet; recompute the full history
    NoDownstreamData,
    /// Downstream ends on the same date as upstream
    UpToDate,
    /// Upstream has this many rows dated after the downstream's last row
    StaleBy(usize),
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::NoDownstreamData => f.write_str("no downstream data"),
            Watermark::UpToDate => f.write_str("up to date"),
            Watermark::StaleBy(n) => write!(f, "stale by {} rows", n),
        }
    }
}

/// Compare an upstream dataset with what is materialized downstream.
///
/// `force` bypasses the comparison and treats every entity as having no
/// downstream data. Pure read; never touches the store.
pub fn resolve(
    upstream: &EntityDataset,
    downstream: Option<&EntityDataset>,
    force: bool,
) -> Result<Watermark> {
    if force {
        return Ok(Watermark::NoDownstreamData);
    }
    let downstream_last = match downstream.and_then(EntityDataset::last_date) {
        Some(date) => date,
        None => return Ok(Watermark::NoDownstreamData),
    };
    let upstream_last = match upstream.last_date() {
        Some(date) => date,
        None => {
            return Err(StocknubError::EmptyDataset(format!(
                "upstream dataset for {}",
                upstream.entity
            )))
        }
    };

    if downstream_last > upstream_last {
        return Err(StocknubError::DownstreamAhead {
            entity: upstream.entity.clone(),
            downstream_last,
            upstream_last,
        });
    }
    if downstream_last == upstream_last {
        return Ok(Watermark::UpToDate);
    }
    Ok(Watermark::StaleBy(upstream.count_after(downstream_last)))
}
