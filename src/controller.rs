use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::{BoxStream, FuturesUnordered};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, sleep_until};

use crate::backend::{BackendError, CreateGameRequest, FinishSummary, GameBackend};
use crate::dwell::{DwellTracker, Observation};
use crate::events::GameEvent;
use crate::grid::{self, CellId, Grid, GridError};
use crate::position::{Fix, LocationError, PositionSender, PositionSource, Sample};
use crate::recorder::{PendingCommit, SettledCommit, VisitError, VisitRecorder};
use crate::session::{Session, SessionPhase, VisitRecord};

/// Delay before retrying an automatic finish that failed.
const FINISH_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid grid: {0}")]
    Grid(String),

    #[error("game {0} came back without a grid")]
    MissingGrid(String),

    #[error("game is finished")]
    Finished,

    #[error("cannot {action} while {phase:?}")]
    InvalidTransition {
        action: &'static str,
        phase: SessionPhase,
    },

    #[error("session task has stopped")]
    Stopped,
}

impl From<GridError> for SessionError {
    fn from(e: GridError) -> Self {
        SessionError::Grid(e.to_string())
    }
}

/// Point-in-time view of a running session for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub game_id: String,
    pub nickname: String,
    pub phase: SessionPhase,
    pub current_cell: Option<CellId>,
    pub dwell_remaining_s: Option<u64>,
    pub visited_count: u32,
    pub total_cells: u32,
    pub score_pct: f64,
    pub commits_in_flight: usize,
    pub location_error: Option<String>,
    pub summary: Option<FinishSummary>,
}

pub enum Command {
    Pause(oneshot::Sender<Result<SessionPhase, SessionError>>),
    Unpause(oneshot::Sender<Result<SessionPhase, SessionError>>),
    Finish(oneshot::Sender<Result<FinishSummary, SessionError>>),
    Status(oneshot::Sender<StatusSnapshot>),
    Visits(oneshot::Sender<Vec<VisitRecord>>),
    /// Settle in-flight commits, then end the loop.
    Stop(oneshot::Sender<()>),
}

/// One game: grid, dwell tracker, recorder and session mirror, all owned by
/// the single task running [`SessionController::run`].
pub struct SessionController<B: GameBackend> {
    backend: Arc<B>,
    session: Session,
    grid: Grid,
    tracker: DwellTracker,
    recorder: VisitRecorder<B>,
    pending: FuturesUnordered<PendingCommit>,
    events: broadcast::Sender<GameEvent>,
    last_fix: Option<Fix>,
    max_accuracy_m: Option<f64>,
    location_error: Option<LocationError>,
    summary: Option<FinishSummary>,
}

impl<B: GameBackend> SessionController<B> {
    fn new(
        backend: Arc<B>,
        session: Session,
        grid: Grid,
        events: broadcast::Sender<GameEvent>,
    ) -> Self {
        let min_dwell = Duration::from_secs(u64::from(session.min_dwell_s));
        Self {
            recorder: VisitRecorder::new(Arc::clone(&backend)),
            backend,
            session,
            grid,
            tracker: DwellTracker::new(min_dwell),
            pending: FuturesUnordered::new(),
            events,
            last_fix: None,
            max_accuracy_m: None,
            location_error: None,
            summary: None,
        }
    }

    /// Create a new game on the backend. The controller starts in `Setup`.
    pub async fn create(
        backend: Arc<B>,
        request: &CreateGameRequest,
        events: broadcast::Sender<GameEvent>,
    ) -> Result<Self, SessionError> {
        let created = backend.create_game(request).await?;
        let grid = Grid::from_geojson(&created.grid)?;
        if grid.len() != created.total_cells as usize {
            tracing::warn!(
                "game {} reports {} cells but grid has {}",
                created.game_id,
                created.total_cells,
                grid.len()
            );
        }

        tracing::info!(
            "created game {} with {} cells, min dwell {}s",
            created.game_id,
            grid.len(),
            created.min_dwell_s
        );

        let session = Session::new(
            created.game_id,
            created.nickname,
            created.min_dwell_s,
            created.time_limit_s,
            created.total_cells,
            created.started_at,
        );
        Ok(Self::new(backend, session, grid, events))
    }

    /// Rehydrate an unfinished game from the backend. Prior visits are
    /// restored as-is; dwell tracking starts idle.
    pub async fn resume(
        backend: Arc<B>,
        game_id: &str,
        events: broadcast::Sender<GameEvent>,
    ) -> Result<Self, SessionError> {
        let state = backend.game_state(game_id).await?;
        if state.finished_at.is_some() {
            return Err(SessionError::Finished);
        }
        let grid_value = state
            .grid
            .as_ref()
            .ok_or_else(|| SessionError::MissingGrid(state.game_id.clone()))?;
        let grid = Grid::from_geojson(grid_value)?;

        let min_dwell_s = state.min_dwell_s.unwrap_or(10);
        let started_at = Utc::now() - chrono::Duration::seconds(state.elapsed_s.max(0));
        let mut session = Session::new(
            state.game_id,
            state.nickname,
            min_dwell_s,
            state.time_limit_s,
            state.total_cells,
            started_at,
        );
        for visit in state.visits {
            session.put_visit(VisitRecord {
                cell_id: visit.cell_id,
                visit_count: visit.visit_count,
                dwell_s: visit.dwell_s,
            });
        }
        session.set_score(state.visited_count, state.score_pct);

        tracing::info!(
            "resumed game {} with {} prior visits ({:.1}%)",
            session.id,
            session.visit_records(),
            session.score_pct
        );

        Ok(Self::new(backend, session, grid, events))
    }

    /// Ignore fixes whose accuracy radius exceeds `meters`.
    pub fn with_accuracy_limit(mut self, meters: Option<f64>) -> Self {
        self.max_accuracy_m = meters;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn tracker(&self) -> &DwellTracker {
        &self.tracker
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase
    }

    fn emit(&self, event: GameEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.session.phase != phase {
            tracing::info!("game {}: {:?} -> {phase:?}", self.session.id, self.session.phase);
            self.session.phase = phase;
            self.emit(GameEvent::PhaseChanged { phase });
        }
    }

    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.session.phase {
            SessionPhase::Setup => {
                self.set_phase(SessionPhase::Active);
                Ok(())
            }
            SessionPhase::Finished => Err(SessionError::Finished),
            phase => Err(SessionError::InvalidTransition {
                action: "start",
                phase,
            }),
        }
    }

    /// Suspend play. A pending dwell is dropped, not committed.
    pub fn pause(&mut self) -> Result<SessionPhase, SessionError> {
        match self.session.phase {
            SessionPhase::Active => {
                if let Some(c) = self.tracker.interrupt() {
                    tracing::info!("pause cancels pending dwell in {}", c.cell_id);
                }
                self.set_phase(SessionPhase::Paused);
                Ok(SessionPhase::Paused)
            }
            SessionPhase::Paused => Ok(SessionPhase::Paused),
            SessionPhase::Finished => Err(SessionError::Finished),
            phase => Err(SessionError::InvalidTransition {
                action: "pause",
                phase,
            }),
        }
    }

    /// Continue after a pause. Time spent paused never counts as dwell.
    pub fn unpause(&mut self) -> Result<SessionPhase, SessionError> {
        match self.session.phase {
            SessionPhase::Paused => {
                self.tracker.interrupt();
                self.set_phase(SessionPhase::Active);
                Ok(SessionPhase::Active)
            }
            SessionPhase::Active => Ok(SessionPhase::Active),
            SessionPhase::Finished => Err(SessionError::Finished),
            phase => Err(SessionError::InvalidTransition {
                action: "unpause",
                phase,
            }),
        }
    }

    pub fn handle_fix(&mut self, fix: Fix, now: Instant) {
        if self.session.phase != SessionPhase::Active {
            tracing::trace!("discarding fix while {:?}", self.session.phase);
            return;
        }
        if let (Some(limit), Some(accuracy)) = (self.max_accuracy_m, fix.accuracy_m)
            && accuracy > limit
        {
            tracing::debug!("ignoring fix with accuracy {accuracy:.0}m (limit {limit:.0}m)");
            return;
        }

        if self.location_error.take().is_some() {
            tracing::info!("location available again");
        }
        self.last_fix = Some(fix);
        self.emit(GameEvent::PositionUpdated {
            lat: fix.lat,
            lon: fix.lon,
            accuracy_m: fix.accuracy_m,
        });

        let cell_id = grid::locate(fix.point(), &self.grid);
        if let Observation::Entered { cell_id, .. } = self.tracker.observe(cell_id, now, Utc::now()) {
            match &cell_id {
                Some(id) => tracing::debug!("entered {id}"),
                None => tracing::debug!("outside grid"),
            }
            let visited = cell_id
                .as_ref()
                .is_some_and(|id| self.session.has_visited(id));
            self.emit(GameEvent::CellEntered { cell_id, visited });
            self.emit_progress(now);
        }
    }

    /// Location lost: stop counting dwell until fixes come back.
    pub fn handle_location_error(&mut self, error: LocationError) {
        tracing::warn!("location unavailable: {error}");
        if let Some(c) = self.tracker.interrupt() {
            tracing::info!("location loss cancels pending dwell in {}", c.cell_id);
        }
        self.emit(GameEvent::LocationUnavailable {
            message: error.to_string(),
        });
        self.location_error = Some(error);
    }

    /// Dwell timer expiry: confirm the candidate and start its commit.
    pub fn handle_deadline(&mut self, now: Instant) {
        let Some(at) = self.last_fix.map(|f| f.point()) else {
            return;
        };
        let Some(dwell) = self.tracker.fire(now, at) else {
            return;
        };
        tracing::info!("dwell complete in {}", dwell.cell_id);

        match self.recorder.confirm_visit(&self.session, &dwell) {
            Ok(pending) => self.pending.push(pending),
            Err(VisitError::InFlight(cell_id)) => {
                tracing::debug!("commit for {cell_id} already in flight, ignoring confirmation");
            }
            Err(e) => self.emit(GameEvent::VisitFailed {
                cell_id: dwell.cell_id,
                error: e.to_string(),
            }),
        }
    }

    pub fn handle_settled(&mut self, settled: SettledCommit) {
        let cell_id = settled.commit.cell_id.clone();
        match self.recorder.settle(&mut self.session, settled) {
            Ok(outcome) => self.emit(GameEvent::VisitConfirmed {
                cell_id: outcome.cell_id,
                visit_count: outcome.visit_count,
                visited_count: outcome.visited_count,
                score_pct: outcome.score_pct,
            }),
            Err(e) => self.emit(GameEvent::VisitFailed {
                cell_id,
                error: e.to_string(),
            }),
        }
    }

    fn emit_progress(&self, now: Instant) {
        if let (Some(candidate), Some(remaining)) =
            (self.tracker.candidate(), self.tracker.remaining(now))
        {
            self.emit(GameEvent::DwellProgress {
                cell_id: candidate.cell_id.clone(),
                remaining_s: remaining.as_secs_f64().ceil() as u64,
            });
        }
    }

    /// End the game. Waits for in-flight commits, then asks the backend for
    /// the final summary. On success the session is read-only.
    pub async fn finish(&mut self) -> Result<FinishSummary, SessionError> {
        if self.session.is_finished() {
            return Err(SessionError::Finished);
        }
        self.wind_down().await;

        let summary = self.backend.finish_game(&self.session.id).await?;
        self.session.finished_at = Some(Utc::now());
        self.session
            .set_score(summary.visited_count, summary.score_pct);
        self.summary = Some(summary.clone());
        self.set_phase(SessionPhase::Finished);

        tracing::info!(
            "game {} finished: {}/{} cells ({:.1}%) in {}s",
            self.session.id,
            summary.visited_count,
            summary.total_cells,
            summary.score_pct,
            summary.elapsed_s
        );
        self.emit(GameEvent::SessionFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Stop dwell tracking and wait for every in-flight commit to settle.
    async fn wind_down(&mut self) {
        self.tracker.interrupt();
        while let Some(settled) = self.pending.next().await {
            self.handle_settled(settled);
        }
    }

    pub fn status(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            game_id: self.session.id.clone(),
            nickname: self.session.nickname.clone(),
            phase: self.session.phase,
            current_cell: self.tracker.current().cloned(),
            dwell_remaining_s: self
                .tracker
                .remaining(now)
                .map(|r| r.as_secs_f64().ceil() as u64),
            visited_count: self.session.visited_count,
            total_cells: self.session.total_cells,
            score_pct: self.session.score_pct,
            commits_in_flight: self.recorder.outstanding(),
            location_error: self.location_error.as_ref().map(ToString::to_string),
            summary: self.summary.clone(),
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Command::Unpause(reply) => {
                let _ = reply.send(self.unpause());
            }
            Command::Finish(reply) => {
                let result = self.finish().await;
                if let Err(ref e) = result {
                    tracing::warn!("finish failed: {e}");
                }
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status(Instant::now()));
            }
            Command::Visits(reply) => {
                let _ = reply.send(self.session.visits());
            }
            Command::Stop(reply) => {
                tracing::info!(
                    "game {}: stopping with {} commit(s) in flight",
                    self.session.id,
                    self.recorder.outstanding()
                );
                self.wind_down().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Drive the session until every [`SessionHandle`] is dropped. Returns
    /// the final session state.
    pub async fn run<S: PositionSource>(
        mut self,
        source: S,
        mut commands: mpsc::Receiver<Command>,
    ) -> Session {
        if self.session.phase == SessionPhase::Setup
            && let Err(e) = self.start()
        {
            tracing::error!("cannot start game {}: {e}", self.session.id);
        }

        let mut samples = Some(source.samples());
        let mut progress = tokio::time::interval(Duration::from_secs(1));
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut time_limit = self.session.deadline().map(|deadline| {
            let left = (deadline - Utc::now()).to_std().unwrap_or_default();
            Instant::now() + left
        });

        loop {
            if self.session.is_finished() {
                samples = None;
                time_limit = None;
            }
            let dwell_deadline = self.tracker.deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        tracing::info!("game {}: all handles dropped, stopping", self.session.id);
                        break;
                    }
                },
                sample = next_sample(&mut samples), if samples.is_some() => match sample {
                    Some(Ok(fix)) => self.handle_fix(fix, Instant::now()),
                    Some(Err(e)) => {
                        let fatal = e.is_fatal();
                        self.handle_location_error(e);
                        if fatal {
                            samples = None;
                        }
                    }
                    None => {
                        self.handle_location_error(LocationError::Unavailable(
                            "position feed ended".into(),
                        ));
                        samples = None;
                    }
                },
                _ = sleep_until(dwell_deadline.unwrap_or_else(Instant::now)), if dwell_deadline.is_some() => {
                    self.handle_deadline(Instant::now());
                }
                Some(settled) = self.pending.next(), if !self.pending.is_empty() => {
                    self.handle_settled(settled);
                }
                _ = progress.tick(), if self.tracker.candidate().is_some() => {
                    self.emit_progress(Instant::now());
                }
                _ = sleep_until(time_limit.unwrap_or_else(Instant::now)), if time_limit.is_some() => {
                    tracing::info!("game {}: time limit reached", self.session.id);
                    time_limit = None;
                    if let Err(e) = self.finish().await {
                        tracing::error!(
                            "automatic finish failed, retrying in {}s: {e}",
                            FINISH_RETRY.as_secs()
                        );
                        time_limit = Some(Instant::now() + FINISH_RETRY);
                    }
                }
            }
        }

        self.session
    }

    /// Run the session on its own task.
    pub fn spawn<S: PositionSource>(self, source: S) -> (SessionHandle, JoinHandle<Session>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = SessionHandle {
            game_id: self.session.id.clone(),
            commands: tx,
            positions: None,
        };
        let task = tokio::spawn(self.run(source, rx));
        (handle, task)
    }
}

async fn next_sample(samples: &mut Option<BoxStream<'static, Sample>>) -> Option<Sample> {
    match samples {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    game_id: String,
    commands: mpsc::Sender<Command>,
    positions: Option<PositionSender>,
}

impl SessionHandle {
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// Attach the feed the local API pushes browser fixes into.
    pub fn with_positions(mut self, positions: PositionSender) -> Self {
        self.positions = Some(positions);
        self
    }

    pub fn positions(&self) -> Option<&PositionSender> {
        self.positions.as_ref()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn pause(&self) -> Result<SessionPhase, SessionError> {
        self.request(Command::Pause).await?
    }

    pub async fn unpause(&self) -> Result<SessionPhase, SessionError> {
        self.request(Command::Unpause).await?
    }

    pub async fn finish(&self) -> Result<FinishSummary, SessionError> {
        self.request(Command::Finish).await?
    }

    pub async fn status(&self) -> Result<StatusSnapshot, SessionError> {
        self.request(Command::Status).await
    }

    pub async fn visits(&self) -> Result<Vec<VisitRecord>, SessionError> {
        self.request(Command::Visits).await
    }

    /// End the session loop once its in-flight commits have settled. The
    /// game stays open on the backend and can be resumed.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(Command::Stop).await
    }
}
