use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::controller::SessionHandle;
use crate::events::GameEvent;
use crate::session::Session;

/// The game currently driven by the local API.
pub struct ActiveSession {
    pub handle: SessionHandle,
    pub task: JoinHandle<Session>,
}

pub struct AppStateInner<B> {
    pub config: Config,
    pub backend: Arc<B>,
    pub session: Option<ActiveSession>,
    /// Shared by every session so `/events` subscribers survive a new game.
    pub events: broadcast::Sender<GameEvent>,
}

pub type AppState<B> = Arc<Mutex<AppStateInner<B>>>;

impl<B> AppStateInner<B> {
    pub fn new(config: Config, backend: Arc<B>, events: broadcast::Sender<GameEvent>) -> Self {
        Self {
            config,
            backend,
            session: None,
            events,
        }
    }

    /// Handle to the current session, if its task is still running.
    pub fn handle(&self) -> Option<SessionHandle> {
        self.session
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.handle.clone())
    }

    /// Install a new session. A previous one is stopped in the background
    /// once its in-flight commits have settled; its game stays resumable.
    pub fn replace_session(&mut self, next: ActiveSession) {
        let Some(prev) = self.session.replace(next) else {
            return;
        };
        tracing::info!("replacing session {}", prev.handle.game_id());
        tokio::spawn(async move {
            if let Err(e) = prev.handle.stop().await {
                tracing::debug!("session {} already stopped: {e}", prev.handle.game_id());
            }
            match prev.task.await {
                Ok(session) => tracing::info!(
                    "session {} stopped with {} visited cells",
                    session.id,
                    session.visited_count
                ),
                Err(e) => tracing::warn!("session {} task failed: {e}", prev.handle.game_id()),
            }
        });
    }
}
