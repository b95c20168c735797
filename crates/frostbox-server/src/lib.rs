//! The TCP server (`§4.6`): listener, per-connection dispatch loop, and the
//! bounded feed pipeline that bridges a socket to the data store.

mod config;
mod connection;
mod listener;

pub use config::ServerConfig;
pub use connection::handle_connection;
pub use listener::{bind_listener, serve};
