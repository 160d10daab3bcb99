//! Transport layer: WebSocket listener carrying JSON frames.

pub mod websocket;
