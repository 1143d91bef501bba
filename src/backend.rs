use std::future::Future;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::grid::{CellId, GeoPoint};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Transport failures and server-side errors, as opposed to the backend
    /// refusing the request itself.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Rejected { status, .. } => *status >= 500,
            BackendError::Decode(_) => false,
        }
    }
}

/// Either a published board or a circle around a center point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateGameRequest {
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_m: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_type: Option<String>,
    #[serde(default = "default_min_dwell_s")]
    pub min_dwell_s: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_s: Option<u32>,
}

fn default_min_dwell_s() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameCreated {
    pub game_id: String,
    pub nickname: String,
    pub total_cells: u32,
    pub min_dwell_s: u32,
    #[serde(default)]
    pub time_limit_s: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub grid: Value,
    #[serde(default)]
    pub board_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorVisit {
    pub cell_id: CellId,
    pub visit_count: u32,
    pub dwell_s: u32,
}

/// Game state as returned by `GET /games/{id}/?include_grid=true`.
#[derive(Debug, Clone, Deserialize)]
pub struct GameState {
    pub game_id: String,
    pub nickname: String,
    pub total_cells: u32,
    pub visited_count: u32,
    pub score_pct: f64,
    pub elapsed_s: i64,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visits: Vec<PriorVisit>,
    #[serde(default)]
    pub grid: Option<Value>,
    #[serde(default)]
    pub min_dwell_s: Option<u32>,
    #[serde(default)]
    pub time_limit_s: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitCommit {
    pub cell_id: CellId,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitAck {
    pub visit_count: u32,
    pub visited_count: u32,
    pub score_pct: f64,
    /// Dwell the backend stored; older backends omit it.
    #[serde(default)]
    pub dwell_s: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishSummary {
    pub visited_count: u32,
    pub total_cells: u32,
    pub score_pct: f64,
    pub elapsed_s: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameListing {
    pub game_id: String,
    pub nickname: String,
    pub grid_type: String,
    pub total_cells: u32,
    pub visited_count: u32,
    pub score_pct: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub board_name: Option<String>,
}

/// A published board games can be created on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub grid_type: String,
    /// Meters to the nearest edge of the board's area; only set when listed
    /// near a point.
    #[serde(default)]
    pub distance_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatusFilter {
    Active,
    Finished,
}

impl GameStatusFilter {
    fn as_str(self) -> &'static str {
        match self {
            GameStatusFilter::Active => "active",
            GameStatusFilter::Finished => "finished",
        }
    }
}

/// The backend's request/response contract. The backend is authoritative for
/// dwell validation, visit counts and score.
pub trait GameBackend: Send + Sync + 'static {
    fn create_game(
        &self,
        request: &CreateGameRequest,
    ) -> impl Future<Output = Result<GameCreated, BackendError>> + Send;

    /// Game state including the grid, for resuming.
    fn game_state(
        &self,
        game_id: &str,
    ) -> impl Future<Output = Result<GameState, BackendError>> + Send;

    fn record_visit(
        &self,
        game_id: &str,
        commit: &VisitCommit,
    ) -> impl Future<Output = Result<VisitAck, BackendError>> + Send;

    fn finish_game(
        &self,
        game_id: &str,
    ) -> impl Future<Output = Result<FinishSummary, BackendError>> + Send;

    fn list_games(
        &self,
        status: Option<GameStatusFilter>,
    ) -> impl Future<Output = Result<Vec<GameListing>, BackendError>> + Send;

    /// Active boards. With `near`, only the closest few, nearest first.
    fn list_boards(
        &self,
        near: Option<GeoPoint>,
    ) -> impl Future<Output = Result<Vec<Board>, BackendError>> + Send;

    /// Delete a game and its visits. Only the owning player may.
    fn delete_game(&self, game_id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    player_token: String,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            player_token: config.player_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("X-Player-Token", self.player_token.as_str())
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("X-Player-Token", self.player_token.as_str())
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(self.url(path))
            .header("X-Player-Token", self.player_token.as_str())
    }
}

impl GameBackend for HttpBackend {
    async fn create_game(&self, request: &CreateGameRequest) -> Result<GameCreated, BackendError> {
        send(self.post("/games/").json(request)).await
    }

    async fn game_state(&self, game_id: &str) -> Result<GameState, BackendError> {
        send(
            self.get(&format!("/games/{game_id}/"))
                .query(&[("include_grid", "true")]),
        )
        .await
    }

    async fn record_visit(
        &self,
        game_id: &str,
        commit: &VisitCommit,
    ) -> Result<VisitAck, BackendError> {
        send(self.post(&format!("/games/{game_id}/visits/")).json(commit)).await
    }

    async fn finish_game(&self, game_id: &str) -> Result<FinishSummary, BackendError> {
        send(self.post(&format!("/games/{game_id}/finish/"))).await
    }

    async fn list_games(
        &self,
        status: Option<GameStatusFilter>,
    ) -> Result<Vec<GameListing>, BackendError> {
        let mut request = self.get("/games/list/");
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        send(request).await
    }

    async fn list_boards(&self, near: Option<GeoPoint>) -> Result<Vec<Board>, BackendError> {
        let mut request = self.get("/boards/");
        if let Some(p) = near {
            request = request.query(&[("lat", p.lat), ("lon", p.lon)]);
        }
        send(request).await
    }

    async fn delete_game(&self, game_id: &str) -> Result<(), BackendError> {
        execute(self.delete(&format!("/games/{game_id}/delete/"))).await?;
        Ok(())
    }
}

async fn execute(request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
    let resp = request
        .send()
        .await
        .map_err(|e| BackendError::Network(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BackendError::Rejected {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    Ok(resp)
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, BackendError> {
    execute(request)
        .await?
        .json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

/// Pull the human-readable message out of an error payload. The backend
/// uses `{"error": ...}`; framework-level errors use `{"detail": ...}` or
/// per-field lists, which are passed through as-is.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "detail"] {
            if let Some(msg) = value.get(key).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error message".to_string()
    } else {
        trimmed.to_string()
    }
}
