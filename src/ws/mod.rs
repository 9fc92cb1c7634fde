//! WebSocket protocol, connection handling and cross-process event fanout

pub mod fanout;
pub mod handler;
pub mod protocol;
