//! HTTP route handlers: the player-facing stream and playback endpoints
//! plus health checks.

pub mod health;
pub mod playback;
pub mod stream;
