use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;

use crate::backend::{BackendError, CreateGameRequest, GameBackend, GameStatusFilter};
use crate::controller::{SessionController, SessionError, SessionHandle};
use crate::grid::GeoPoint;
use crate::position::{Fix, LocationError, Sample, TrackReplay, push_feed};
use crate::state::{ActiveSession, AppState};

/// Browser fixes buffered between the API and the session loop.
const POSITION_FEED_CAPACITY: usize = 64;

pub fn router<B: GameBackend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/games", post(create_game::<B>).get(list_games::<B>))
        .route("/games/{id}", delete(delete_game::<B>))
        .route("/games/{id}/resume", post(resume_game::<B>))
        .route("/boards", get(list_boards::<B>))
        .route("/pause", post(pause_game::<B>))
        .route("/unpause", post(unpause_game::<B>))
        .route("/finish", post(finish_game::<B>))
        .route("/status", get(get_status::<B>))
        .route("/visits", get(get_visits::<B>))
        .route("/position", post(post_position::<B>))
        .route("/events", get(stream_events::<B>))
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

fn session_error(e: SessionError) -> ApiError {
    let status = match &e {
        SessionError::Backend(BackendError::Rejected { status, .. }) if *status < 500 => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
        }
        SessionError::Backend(_) | SessionError::Grid(_) | SessionError::MissingGrid(_) => {
            StatusCode::BAD_GATEWAY
        }
        SessionError::Finished | SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SessionError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, e.to_string())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    match token {
        Some(token) if token == expected_token => Ok(()),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, "unauthorized")),
    }
}

async fn active_handle<B: GameBackend>(
    state: &AppState<B>,
    headers: &HeaderMap,
) -> Result<SessionHandle, ApiError> {
    let state = state.lock().await;
    check_auth(headers, &state.config.auth_token)?;
    state
        .handle()
        .ok_or_else(|| api_error(StatusCode::CONFLICT, "no active game"))
}

/// Spawn the session loop on the configured position source and make it the
/// active session.
async fn launch<B: GameBackend>(
    state: &AppState<B>,
    controller: SessionController<B>,
    replay: Option<TrackReplay>,
) -> Result<SessionHandle, ApiError> {
    let (handle, task) = match replay {
        Some(replay) => controller.spawn(replay),
        None => {
            let (positions, feed) = push_feed(POSITION_FEED_CAPACITY);
            let (handle, task) = controller.spawn(feed);
            (handle.with_positions(positions), task)
        }
    };

    state.lock().await.replace_session(ActiveSession {
        handle: handle.clone(),
        task,
    });
    Ok(handle)
}

async fn load_replay<B: GameBackend>(state: &AppState<B>) -> Result<Option<TrackReplay>, ApiError> {
    let path = state.lock().await.config.track_file.clone();
    match path {
        Some(path) => TrackReplay::open(&path).await.map(Some).map_err(|e| {
            tracing::error!("track replay unavailable: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }),
        None => Ok(None),
    }
}

async fn create_game<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Json(request): Json<CreateGameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (backend, events, max_accuracy_m) = {
        let s = state.lock().await;
        check_auth(&headers, &s.config.auth_token)?;
        (s.backend.clone(), s.events.clone(), s.config.max_accuracy_m)
    };
    let replay = load_replay(&state).await?;

    let controller = SessionController::create(backend, &request, events)
        .await
        .map_err(session_error)?
        .with_accuracy_limit(max_accuracy_m);

    let handle = launch(&state, controller, replay).await?;
    let status = handle.status().await.map_err(session_error)?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn resume_game<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(game_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (backend, events, max_accuracy_m) = {
        let s = state.lock().await;
        check_auth(&headers, &s.config.auth_token)?;
        (s.backend.clone(), s.events.clone(), s.config.max_accuracy_m)
    };
    let replay = load_replay(&state).await?;

    let controller = SessionController::resume(backend, &game_id, events)
        .await
        .map_err(session_error)?
        .with_accuracy_limit(max_accuracy_m);

    let handle = launch(&state, controller, replay).await?;
    let status = handle.status().await.map_err(session_error)?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct ListParams {
    status: Option<GameStatusFilter>,
}

async fn list_games<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = {
        let s = state.lock().await;
        check_auth(&headers, &s.config.auth_token)?;
        s.backend.clone()
    };

    let games = backend.list_games(params.status).await.map_err(|e| {
        tracing::warn!("listing games failed: {e}");
        session_error(e.into())
    })?;
    Ok(Json(games))
}

/// Deleting the game being played is refused; finish or replace it first.
async fn delete_game<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(game_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = {
        let s = state.lock().await;
        check_auth(&headers, &s.config.auth_token)?;
        if s.handle().is_some_and(|h| h.game_id() == game_id) {
            return Err(api_error(StatusCode::CONFLICT, "game is being played"));
        }
        s.backend.clone()
    };

    backend.delete_game(&game_id).await.map_err(|e| {
        tracing::warn!("deleting game {game_id} failed: {e}");
        session_error(e.into())
    })?;
    tracing::info!("deleted game {game_id}");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct BoardParams {
    lat: Option<f64>,
    lon: Option<f64>,
}

async fn list_boards<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Query(params): Query<BoardParams>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = {
        let s = state.lock().await;
        check_auth(&headers, &s.config.auth_token)?;
        s.backend.clone()
    };

    let near = match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
        (None, None) => None,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "lat and lon must be given together",
            ));
        }
    };

    let boards = backend.list_boards(near).await.map_err(|e| {
        tracing::warn!("listing boards failed: {e}");
        session_error(e.into())
    })?;
    Ok(Json(boards))
}

async fn pause_game<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_handle(&state, &headers).await?;
    let phase = handle.pause().await.map_err(session_error)?;
    Ok(Json(json!({"phase": phase})))
}

async fn unpause_game<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_handle(&state, &headers).await?;
    let phase = handle.unpause().await.map_err(session_error)?;
    Ok(Json(json!({"phase": phase})))
}

async fn finish_game<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_handle(&state, &headers).await?;
    let summary = handle.finish().await.map_err(session_error)?;
    Ok(Json(summary))
}

async fn get_status<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_handle(&state, &headers).await?;
    let status = handle.status().await.map_err(session_error)?;
    Ok(Json(status))
}

async fn get_visits<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_handle(&state, &headers).await?;
    let visits = handle.visits().await.map_err(session_error)?;
    Ok(Json(visits))
}

/// What the map page's `watchPosition` callbacks report.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PositionReport {
    /// `code` follows the browser's `GeolocationPositionError` numbering.
    Failed {
        error: String,
        #[serde(default)]
        code: Option<u8>,
    },
    Fix(Fix),
}

impl From<PositionReport> for Sample {
    fn from(report: PositionReport) -> Self {
        match report {
            PositionReport::Fix(fix) => Ok(fix),
            PositionReport::Failed { code: Some(1), .. } => Err(LocationError::PermissionDenied),
            PositionReport::Failed { code: Some(3), .. } => Err(LocationError::Timeout),
            PositionReport::Failed { error, .. } => Err(LocationError::Unavailable(error)),
        }
    }
}

async fn post_position<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Json(report): Json<PositionReport>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = active_handle(&state, &headers).await?;
    let positions = handle.positions().ok_or_else(|| {
        api_error(
            StatusCode::CONFLICT,
            "positions are replayed from a track file",
        )
    })?;

    if !positions.push(report.into()) {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "session is not accepting positions",
        ));
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct EventParams {
    /// `EventSource` cannot set headers, so the token may come as a query
    /// parameter instead.
    token: Option<String>,
}

async fn stream_events<B: GameBackend>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Query(params): Query<EventParams>,
) -> Result<impl IntoResponse, ApiError> {
    let rx = {
        let s = state.lock().await;
        let query_ok = params.token.as_deref() == Some(s.config.auth_token.as_str());
        if !query_ok {
            check_auth(&headers, &s.config.auth_token)?;
        }
        s.events.subscribe()
    };

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().event(event.name()).json_data(&event) {
                    Ok(sse) => return Some((Ok::<_, Infallible>(sse), rx)),
                    Err(e) => tracing::warn!("cannot encode {} event: {e}", event.name()),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("event subscriber lagging, skipped {skipped} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
