use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the negotiation engine.
///
/// Per-peer variants never abort the session: the coordinator reports them as
/// [`crate::session::SessionEvent::PeerError`] and keeps serving the other
/// links.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    /// Building the transport object (or attaching local media) failed.
    /// Not retried until the caller acquires media again.
    #[error("transport init failed: {0}")]
    TransportInit(String),
    /// Description application or collision handling failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("join of room {room} not confirmed within {after:?}")]
    JoinTimeout { room: String, after: Duration },
    #[error("a join is already in progress")]
    JoinInProgress,
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("join of room {0} aborted by leave")]
    JoinAborted(String),
    #[error("not joined to a room")]
    NotJoined,
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("session closed")]
    SessionClosed,
    /// Writing to an outgoing RTP sink failed.
    #[error("media error: {0}")]
    Media(String),
    #[error("remote candidate rejected: {0}")]
    CandidateRejected(String),
}

impl MeshError {
    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        MeshError::Negotiation(err.to_string())
    }

    pub fn transport_init(err: impl std::fmt::Display) -> Self {
        MeshError::TransportInit(err.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
