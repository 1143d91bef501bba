use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::grid::{CellId, GeoPoint};

/// Pending dwell in a freshly entered cell.
#[derive(Debug, Clone, PartialEq)]
pub struct DwellCandidate {
    pub cell_id: CellId,
    pub entered_at: DateTime<Utc>,
    entered: Instant,
}

/// Emitted when a candidate survives the full minimum dwell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DwellComplete {
    pub cell_id: CellId,
    pub entered_at: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Same cell value as the previous sample.
    Unchanged,
    /// The located cell changed. `cancelled` is the candidate that was
    /// dropped without committing, if one was pending.
    Entered {
        cell_id: Option<CellId>,
        cancelled: Option<DwellCandidate>,
    },
}

/// Turns located cells into confirmed visits. Driven with explicit instants;
/// the session loop sleeps until [`DwellTracker::deadline`].
#[derive(Debug, Clone)]
pub struct DwellTracker {
    min_dwell: Duration,
    /// Last located cell value; `None` is outside the grid or unknown.
    current: Option<CellId>,
    candidate: Option<DwellCandidate>,
}

impl DwellTracker {
    pub fn new(min_dwell: Duration) -> Self {
        Self {
            min_dwell,
            current: None,
            candidate: None,
        }
    }

    pub fn min_dwell(&self) -> Duration {
        self.min_dwell
    }

    pub fn current(&self) -> Option<&CellId> {
        self.current.as_ref()
    }

    pub fn candidate(&self) -> Option<&DwellCandidate> {
        self.candidate.as_ref()
    }

    /// Feed the next located cell value.
    pub fn observe(
        &mut self,
        cell_id: Option<CellId>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Observation {
        if cell_id == self.current {
            return Observation::Unchanged;
        }

        let cancelled = self.candidate.take();
        if let Some(ref c) = cancelled {
            tracing::debug!("left {} before dwell completed", c.cell_id);
        }

        self.current = cell_id.clone();
        if let Some(ref id) = cell_id {
            self.candidate = Some(DwellCandidate {
                cell_id: id.clone(),
                entered_at: wall,
                entered: now,
            });
        }

        Observation::Entered { cell_id, cancelled }
    }

    /// When the pending candidate confirms, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.as_ref().map(|c| c.entered + self.min_dwell)
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(now))
    }

    /// Confirm the candidate if its deadline has passed. The player stays in
    /// the cell, so only a later cell change can start another candidate.
    pub fn fire(&mut self, now: Instant, at: GeoPoint) -> Option<DwellComplete> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let candidate = self.candidate.take()?;
        let elapsed = now.duration_since(candidate.entered);
        let confirmed_at = candidate.entered_at
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        Some(DwellComplete {
            cell_id: candidate.cell_id,
            entered_at: candidate.entered_at,
            confirmed_at,
            lat: at.lat,
            lon: at.lon,
        })
    }

    /// Pause or location loss: drop the candidate and forget the current
    /// cell so the next fix starts over from zero.
    pub fn interrupt(&mut self) -> Option<DwellCandidate> {
        self.current = None;
        self.candidate.take()
    }
}
