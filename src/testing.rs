use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::{
    BackendError, Board, CreateGameRequest, FinishSummary, GameBackend, GameCreated, GameListing,
    GameState, GameStatusFilter, PriorVisit, VisitAck, VisitCommit,
};
use crate::config::Config;
use crate::grid::{CellId, GeoPoint, Grid};
use crate::session::score_pct;

struct FakeGame {
    nickname: String,
    cells: HashSet<CellId>,
    min_dwell_s: u32,
    time_limit_s: Option<u32>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    visits: BTreeMap<CellId, (u32, u32)>,
}

impl FakeGame {
    fn visited_count(&self) -> u32 {
        self.visits.len() as u32
    }

    fn score_pct(&self) -> f64 {
        score_pct(self.visited_count(), self.cells.len() as u32)
    }

    fn elapsed_s(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds()
    }
}

#[derive(Default)]
struct FakeState {
    games: HashMap<String, FakeGame>,
    next_id: u32,
    fail_next_visit: Option<BackendError>,
    fail_next_finish: Option<BackendError>,
    commits: Vec<VisitCommit>,
    boards: Vec<(Board, GeoPoint)>,
}

const MAX_NEARBY_BOARDS: usize = 10;

/// Great-circle distance in meters.
fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub(crate) fn test_config(auth_token: &str) -> Config {
    Config {
        backend_url: "http://backend.invalid".into(),
        player_token: "player".into(),
        auth_token: auth_token.into(),
        listen_addr: "127.0.0.1:0".into(),
        request_timeout: Duration::from_secs(5),
        max_accuracy_m: None,
        track_file: None,
    }
}

pub(crate) struct FakeBackend {
    grid: Value,
    visit_latency: Duration,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    /// Every game created on this backend uses `grid`.
    pub(crate) fn new(grid: Value) -> Self {
        Self {
            grid,
            visit_latency: Duration::ZERO,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn with_visit_latency(mut self, latency: Duration) -> Self {
        self.visit_latency = latency;
        self
    }

    fn cell_ids(&self) -> HashSet<CellId> {
        Grid::from_geojson(&self.grid)
            .expect("fake grid parses")
            .cells()
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    pub(crate) fn seed_game(&self, min_dwell_s: u32, time_limit_s: Option<u32>) -> String {
        let cells = self.cell_ids();
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("game-{}", state.next_id);
        state.games.insert(
            id.clone(),
            FakeGame {
                nickname: "walker".into(),
                cells,
                min_dwell_s,
                time_limit_s,
                started_at: Utc::now(),
                finished_at: None,
                visits: BTreeMap::new(),
            },
        );
        id
    }

    pub(crate) fn seed_visit(&self, game_id: &str, cell_id: &str, visit_count: u32, dwell_s: u32) {
        let mut state = self.state.lock().unwrap();
        let game = state.games.get_mut(game_id).expect("seeded game");
        game.visits
            .insert(CellId::from(cell_id), (visit_count, dwell_s));
    }

    pub(crate) fn mark_finished(&self, game_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(game) = state.games.get_mut(game_id) {
            game.finished_at = Some(Utc::now());
        }
    }

    pub(crate) fn fail_next_visit(&self, error: BackendError) {
        self.state.lock().unwrap().fail_next_visit = Some(error);
    }

    pub(crate) fn fail_next_finish(&self, error: BackendError) {
        self.state.lock().unwrap().fail_next_finish = Some(error);
    }

    /// Boards are located by a single point standing in for their area.
    pub(crate) fn seed_board(&self, name: &str, at: GeoPoint) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.boards.len() as i64 + 1;
        state.boards.push((
            Board {
                id,
                name: name.into(),
                description: String::new(),
                grid_type: "stat_1km".into(),
                distance_m: None,
            },
            at,
        ));
        id
    }

    pub(crate) fn has_game(&self, game_id: &str) -> bool {
        self.state.lock().unwrap().games.contains_key(game_id)
    }

    pub(crate) fn stored_visit_count(&self, game_id: &str, cell_id: &str) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .games
            .get(game_id)?
            .visits
            .get(&CellId::from(cell_id))
            .map(|(count, _)| *count)
    }

    /// Every commit the backend received, accepted or not.
    pub(crate) fn commits(&self) -> Vec<VisitCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    fn not_found(game_id: &str) -> BackendError {
        BackendError::Rejected {
            status: 404,
            message: format!("Game {game_id} not found."),
        }
    }

    fn bad_request(message: String) -> BackendError {
        BackendError::Rejected {
            status: 400,
            message,
        }
    }
}

impl GameBackend for FakeBackend {
    async fn create_game(&self, request: &CreateGameRequest) -> Result<GameCreated, BackendError> {
        if request.min_dwell_s == 0 {
            return Err(Self::bad_request(
                "min_dwell_s: Ensure this value is greater than or equal to 1.".into(),
            ));
        }
        let id = self.seed_game(request.min_dwell_s, request.time_limit_s);
        let state = self.state.lock().unwrap();
        let game = &state.games[&id];
        Ok(GameCreated {
            game_id: id.clone(),
            nickname: request.nickname.clone(),
            total_cells: game.cells.len() as u32,
            min_dwell_s: game.min_dwell_s,
            time_limit_s: game.time_limit_s,
            started_at: game.started_at,
            grid: self.grid.clone(),
            board_name: None,
        })
    }

    async fn game_state(&self, game_id: &str) -> Result<GameState, BackendError> {
        let state = self.state.lock().unwrap();
        let game = state.games.get(game_id).ok_or_else(|| Self::not_found(game_id))?;
        Ok(GameState {
            game_id: game_id.to_string(),
            nickname: game.nickname.clone(),
            total_cells: game.cells.len() as u32,
            visited_count: game.visited_count(),
            score_pct: game.score_pct(),
            elapsed_s: game.elapsed_s(),
            finished_at: game.finished_at,
            visits: game
                .visits
                .iter()
                .map(|(cell_id, (visit_count, dwell_s))| PriorVisit {
                    cell_id: cell_id.clone(),
                    visit_count: *visit_count,
                    dwell_s: *dwell_s,
                })
                .collect(),
            grid: Some(self.grid.clone()),
            min_dwell_s: Some(game.min_dwell_s),
            time_limit_s: game.time_limit_s,
        })
    }

    async fn record_visit(&self, game_id: &str, commit: &VisitCommit) -> Result<VisitAck, BackendError> {
        if !self.visit_latency.is_zero() {
            tokio::time::sleep(self.visit_latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.commits.push(commit.clone());
        if let Some(err) = state.fail_next_visit.take() {
            return Err(err);
        }

        let game = state
            .games
            .get_mut(game_id)
            .ok_or_else(|| Self::not_found(game_id))?;
        if game.finished_at.is_some() {
            return Err(Self::bad_request("Game is already finished.".into()));
        }

        let dwell_s = (commit.exited_at - commit.entered_at).num_seconds();
        if dwell_s < i64::from(game.min_dwell_s) {
            return Err(Self::bad_request(format!(
                "Dwell time {dwell_s}s is less than minimum {}s.",
                game.min_dwell_s
            )));
        }
        if !game.cells.contains(&commit.cell_id) {
            return Err(Self::bad_request(format!(
                "Cell {} is not in the game's play area.",
                commit.cell_id
            )));
        }

        let dwell_s = dwell_s as u32;
        let entry = game
            .visits
            .entry(commit.cell_id.clone())
            .and_modify(|(count, dwell)| {
                *count += 1;
                *dwell = dwell_s;
            })
            .or_insert((1, dwell_s));
        let visit_count = entry.0;

        Ok(VisitAck {
            visit_count,
            visited_count: game.visited_count(),
            score_pct: game.score_pct(),
            dwell_s: Some(dwell_s),
        })
    }

    async fn finish_game(&self, game_id: &str) -> Result<FinishSummary, BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next_finish.take() {
            return Err(err);
        }
        let game = state
            .games
            .get_mut(game_id)
            .ok_or_else(|| Self::not_found(game_id))?;
        if game.finished_at.is_some() {
            return Err(Self::bad_request("Game is already finished.".into()));
        }
        game.finished_at = Some(Utc::now());
        Ok(FinishSummary {
            visited_count: game.visited_count(),
            total_cells: game.cells.len() as u32,
            score_pct: game.score_pct(),
            elapsed_s: game.elapsed_s(),
        })
    }

    async fn list_games(
        &self,
        status: Option<GameStatusFilter>,
    ) -> Result<Vec<GameListing>, BackendError> {
        let state = self.state.lock().unwrap();
        let mut games: Vec<GameListing> = state
            .games
            .iter()
            .filter(|(_, g)| match status {
                Some(GameStatusFilter::Active) => g.finished_at.is_none(),
                Some(GameStatusFilter::Finished) => g.finished_at.is_some(),
                None => true,
            })
            .map(|(id, g)| GameListing {
                game_id: id.clone(),
                nickname: g.nickname.clone(),
                grid_type: "stat_1km".into(),
                total_cells: g.cells.len() as u32,
                visited_count: g.visited_count(),
                score_pct: g.score_pct(),
                started_at: g.started_at,
                finished_at: g.finished_at,
                board_name: None,
            })
            .collect();
        games.sort_by(|a, b| a.game_id.cmp(&b.game_id));
        Ok(games)
    }

    async fn list_boards(&self, near: Option<GeoPoint>) -> Result<Vec<Board>, BackendError> {
        let state = self.state.lock().unwrap();
        let Some(near) = near else {
            return Ok(state.boards.iter().map(|(b, _)| b.clone()).collect());
        };
        let mut boards: Vec<Board> = state
            .boards
            .iter()
            .map(|(b, at)| Board {
                distance_m: Some(distance_m(near, *at)),
                ..b.clone()
            })
            .collect();
        boards.sort_by(|a, b| a.distance_m.unwrap_or(0.0).total_cmp(&b.distance_m.unwrap_or(0.0)));
        boards.truncate(MAX_NEARBY_BOARDS);
        Ok(boards)
    }

    async fn delete_game(&self, game_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state
            .games
            .remove(game_id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(game_id))
    }
}
