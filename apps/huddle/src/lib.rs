pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{HuddleConfig, NegotiationTimings, ReconnectPolicy};
pub use error::{MeshError, MeshResult};
pub use media::{LocalMedia, MediaKind};
pub use session::{JoinedRoom, Session, SessionEvent, SessionSnapshot};
pub use signaling::{PeerId, Reconnect, SignalingChannel};
