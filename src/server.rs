//! Network layer: accepting clients and bridging them to the upstream.
//!
//! ## Architecture
//!
//! ```text
//! +--------+
//! | Server |  <- Accepts TCP connections
//! +--------+
//!      |
//!      v
//! +---------+     +-------------+
//! | Session | --> | ProxyStream |  <- plain or TLS, per leg
//! +---------+     +-------------+
//!      |
//!      v
//! +------------+
//! | QueryCache |  <- memoization + single-flight, shared by all sessions
//! +------------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: TCP listener that spawns sessions
//! - **Session**: one client connection bridged to one upstream connection
//! - **ProxyStream**: an endpoint before or after its in-line TLS upgrade

pub mod listener;
pub mod session;
pub mod stream;

pub use listener::Server;
pub use session::{Session, SessionError};
pub use stream::ProxyStream;
