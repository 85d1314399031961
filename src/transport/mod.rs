//! Stream transports wrapping outbound protocols

pub mod websocket;
