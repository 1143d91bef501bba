use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::backend::{BackendError, GameBackend, VisitAck, VisitCommit};
use crate::dwell::DwellComplete;
use crate::grid::CellId;
use crate::session::{Session, VisitRecord};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VisitError {
    #[error("a visit to {0} is already being recorded")]
    InFlight(CellId),

    #[error("visit rejected: {0}")]
    Rejected(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("session is finished")]
    SessionFinished,
}

impl From<BackendError> for VisitError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Rejected { status, message } if status < 500 => VisitError::Rejected(message),
            // An unreadable 2xx leaves the outcome unknown; treat it like a lost response.
            other => VisitError::Network(other.to_string()),
        }
    }
}

/// A commit that has come back from the backend.
#[derive(Debug, Clone)]
pub struct SettledCommit {
    pub commit: VisitCommit,
    pub result: Result<VisitAck, BackendError>,
}

pub type PendingCommit = BoxFuture<'static, SettledCommit>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitOutcome {
    pub cell_id: CellId,
    pub visit_count: u32,
    pub visited_count: u32,
    pub score_pct: f64,
    /// False for repeat visits to an already visited cell.
    pub first_visit: bool,
}

/// Copies counts and score from backend responses only, never increments
/// locally.
pub struct VisitRecorder<B> {
    backend: Arc<B>,
    in_flight: HashSet<CellId>,
}

impl<B: GameBackend> VisitRecorder<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            in_flight: HashSet::new(),
        }
    }

    pub fn is_in_flight(&self, cell_id: &CellId) -> bool {
        self.in_flight.contains(cell_id)
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Start committing a confirmed dwell. The returned future performs the
    /// request; pass its output to [`VisitRecorder::settle`].
    pub fn confirm_visit(
        &mut self,
        session: &Session,
        dwell: &DwellComplete,
    ) -> Result<PendingCommit, VisitError> {
        if session.is_finished() {
            return Err(VisitError::SessionFinished);
        }
        if !self.in_flight.insert(dwell.cell_id.clone()) {
            return Err(VisitError::InFlight(dwell.cell_id.clone()));
        }

        let commit = VisitCommit {
            cell_id: dwell.cell_id.clone(),
            entered_at: dwell.entered_at,
            exited_at: dwell.confirmed_at,
            lat: dwell.lat,
            lon: dwell.lon,
        };
        tracing::info!(
            "committing visit to {} (dwell {}s)",
            commit.cell_id,
            (commit.exited_at - commit.entered_at).num_seconds()
        );

        let backend = Arc::clone(&self.backend);
        let game_id = session.id.clone();
        Ok(async move {
            let result = backend.record_visit(&game_id, &commit).await;
            SettledCommit { commit, result }
        }
        .boxed())
    }

    /// Apply a returned commit to the session. Failures leave the session
    /// untouched; the player retries by dwelling in the cell again.
    pub fn settle(
        &mut self,
        session: &mut Session,
        settled: SettledCommit,
    ) -> Result<VisitOutcome, VisitError> {
        let SettledCommit { commit, result } = settled;
        self.in_flight.remove(&commit.cell_id);

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("visit to {} not recorded: {e}", commit.cell_id);
                return Err(e.into());
            }
        };

        let first_visit = !session.has_visited(&commit.cell_id);
        let submitted_dwell = (commit.exited_at - commit.entered_at).num_seconds().max(0);
        let dwell_s = ack
            .dwell_s
            .unwrap_or_else(|| u32::try_from(submitted_dwell).unwrap_or(u32::MAX));

        session.put_visit(VisitRecord {
            cell_id: commit.cell_id.clone(),
            visit_count: ack.visit_count,
            dwell_s,
        });
        // Unique visits never decrease server-side, so an older aggregate
        // arriving late must not roll the score back.
        if ack.visited_count >= session.visited_count {
            session.set_score(ack.visited_count, ack.score_pct);
        }

        tracing::info!(
            "visit to {} recorded: visit_count={} visited={} score={:.1}%",
            commit.cell_id,
            ack.visit_count,
            ack.visited_count,
            ack.score_pct
        );

        Ok(VisitOutcome {
            cell_id: commit.cell_id,
            visit_count: ack.visit_count,
            visited_count: ack.visited_count,
            score_pct: ack.score_pct,
            first_visit,
        })
    }
}
