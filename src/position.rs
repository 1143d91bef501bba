use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};

use crate::grid::GeoPoint;

/// One geolocation sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
    /// Accuracy radius in meters, when the device reports one.
    #[serde(default, alias = "accuracy")]
    pub accuracy_m: Option<f64>,
}

impl Fix {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy_m: None,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("position request timed out")]
    Timeout,
}

impl LocationError {
    /// Denied permission and hardware failures end sampling; timeouts are
    /// retried by the device.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LocationError::Timeout)
    }
}

pub type Sample = std::result::Result<Fix, LocationError>;

/// A continuous, cancellable geolocation feed. Dropping the stream cancels
/// sampling.
pub trait PositionSource: Send + 'static {
    fn samples(self) -> BoxStream<'static, Sample>;
}

/// Handle the local API uses to push browser fixes into a running session.
#[derive(Debug, Clone)]
pub struct PositionSender {
    tx: mpsc::Sender<Sample>,
}

impl PositionSender {
    /// Returns false when the session has stopped listening or is lagging
    /// behind by more than the feed capacity.
    pub fn push(&self, sample: Sample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("position feed full, dropping sample");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Fixes pushed from outside (the map page's `watchPosition`).
pub struct PushFeed {
    rx: mpsc::Receiver<Sample>,
}

pub fn push_feed(capacity: usize) -> (PositionSender, PushFeed) {
    let (tx, rx) = mpsc::channel(capacity);
    (PositionSender { tx }, PushFeed { rx })
}

impl PositionSource for PushFeed {
    fn samples(self) -> BoxStream<'static, Sample> {
        stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|sample| (sample, rx))
        })
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct TrackPoint {
    /// Seconds since the start of the recording.
    t: f64,
    lat: f64,
    lon: f64,
    #[serde(default, alias = "accuracy")]
    accuracy_m: Option<f64>,
}

/// Replays a recorded walk with its original timing.
///
/// Track files are newline-delimited JSON, one `{"t", "lat", "lon",
/// "accuracy"?}` object per line; blank lines and `#` comments are skipped.
#[derive(Debug, Clone)]
pub struct TrackReplay {
    points: Vec<(Duration, Fix)>,
}

impl TrackReplay {
    pub async fn open(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read track file {}", path.display()))?;
        let replay = Self::parse(&contents);
        if replay.points.is_empty() {
            anyhow::bail!("track file {} has no usable points", path.display());
        }
        tracing::info!("loaded {} track points from {}", replay.points.len(), path.display());
        Ok(replay)
    }

    pub fn parse(contents: &str) -> Self {
        let mut points: Vec<(Duration, Fix)> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match serde_json::from_str::<TrackPoint>(line) {
                Ok(p) => match Duration::try_from_secs_f64(p.t) {
                    Ok(offset) => Some((offset, p.fix())),
                    Err(e) => {
                        tracing::warn!("skipping track point with invalid offset: {line} ({e})");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("skipping invalid track line: {line} ({e})");
                    None
                }
            })
            .collect();
        points.sort_by_key(|(offset, _)| *offset);
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Recorded fixes with their offset from the start of the track.
    pub fn fixes(&self) -> impl Iterator<Item = (Duration, Fix)> + '_ {
        self.points.iter().copied()
    }
}

impl TrackPoint {
    fn fix(&self) -> Fix {
        Fix {
            lat: self.lat,
            lon: self.lon,
            accuracy_m: self.accuracy_m,
        }
    }
}

impl PositionSource for TrackReplay {
    fn samples(self) -> BoxStream<'static, Sample> {
        let start = Instant::now();
        stream::iter(self.points)
            .then(move |(offset, fix)| async move {
                sleep_until(start + offset).await;
                Ok(fix)
            })
            .boxed()
    }
}
