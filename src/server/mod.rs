//! Client-facing TCP server

mod connection;
pub mod protocol;

pub use connection::ConnectionManager;
pub use protocol::{Response, Session, SessionState};
