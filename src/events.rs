use serde::Serialize;

use crate::backend::FinishSummary;
use crate::grid::CellId;
use crate::session::SessionPhase;

/// Notifications for the map page, delivered over the local API's event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    PositionUpdated {
        lat: f64,
        lon: f64,
        accuracy_m: Option<f64>,
    },
    /// `cell_id` is null when the player is outside the grid.
    CellEntered {
        cell_id: Option<CellId>,
        visited: bool,
    },
    DwellProgress {
        cell_id: CellId,
        remaining_s: u64,
    },
    VisitConfirmed {
        cell_id: CellId,
        visit_count: u32,
        visited_count: u32,
        score_pct: f64,
    },
    VisitFailed {
        cell_id: CellId,
        error: String,
    },
    LocationUnavailable {
        message: String,
    },
    PhaseChanged {
        phase: SessionPhase,
    },
    SessionFinished {
        summary: FinishSummary,
    },
}

impl GameEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::PositionUpdated { .. } => "position_updated",
            GameEvent::CellEntered { .. } => "cell_entered",
            GameEvent::DwellProgress { .. } => "dwell_progress",
            GameEvent::VisitConfirmed { .. } => "visit_confirmed",
            GameEvent::VisitFailed { .. } => "visit_failed",
            GameEvent::LocationUnavailable { .. } => "location_unavailable",
            GameEvent::PhaseChanged { .. } => "phase_changed",
            GameEvent::SessionFinished { .. } => "session_finished",
        }
    }
}
