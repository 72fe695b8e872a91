//! Shared types for the button controller: YAML configuration, the remote
//! playback service's JSON bodies, and the framed local control protocol.

pub mod config;
pub mod platform;
pub mod protocol;
