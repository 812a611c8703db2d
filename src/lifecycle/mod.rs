//! Process lifecycle: shutdown signals.
//!
//! There is no separate coordinator object: the serve loop owns a stop
//! channel for the pub/sub listener (see `server::HttpServer::run`) and
//! everything else winds down when the accept loop does.

pub mod signals;

pub use signals::shutdown_signal;
