//! PeerCall client call layer.
//!
//! Drives 1:1 end-to-end encrypted calls: signaling dispatch, the peer
//! transport lifecycle, session key exchange and rotation, and the routing of
//! remote video tracks. Media capture and the peer transport itself are
//! supplied through the traits in [`media`] and [`transport`]; [`loopback`]
//! provides an in-process implementation of both.

pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod keys;
pub mod loopback;
pub mod manager;
pub mod media;
pub mod registry;
pub mod relay;
pub mod router;
pub mod routing;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::CallConfig;
pub use directory::{Directory, StaticDirectory};
pub use error::CallError;
pub use events::{CallEvent, CallState, EventSink};
pub use manager::{CallBackends, CallManager};
pub use media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
pub use relay::RelayClient;
pub use router::SignalRouter;
pub use routing::{TrackRouter, VideoRoute};
pub use session::Role;
pub use signaling::SignalingSink;
pub use transport::{PeerTransport, TransportEvent, TransportFactory};
