//! Local and remote media tracks as seen by the call layer.
//!
//! Capture and playback live outside this crate; the call layer only needs
//! track identity, kind, and a way to stop locally owned tracks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Release the underlying device. Must tolerate repeated calls.
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// A group of tracks that play out together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn has_track(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            if track.is_live() {
                track.stop();
            }
        }
    }
}

/// Source of local media. Each call acquires its own streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_audio(&self) -> Result<MediaStream, CallError>;
    async fn acquire_video(&self) -> Result<MediaStream, CallError>;
    async fn acquire_screen(&self) -> Result<MediaStream, CallError>;
}

/// A locally captured track backed by nothing but a liveness flag.
///
/// Used by the loopback transport and by embedders that manage capture
/// themselves and only need the call layer to signal when to stop.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    stops: AtomicU32,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            live: AtomicBool::new(true),
            stops: AtomicU32::new(0),
        })
    }

    /// How many times `stop` released the track (0 or 1).
    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}
