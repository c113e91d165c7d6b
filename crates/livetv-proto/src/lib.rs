//! Shared types and the scheduling engine for the virtual live channel.
//!
//! The daemon owns playback; everything that decides *what* should be on air
//! and *where* in it lives here so it can be exercised without a player.

pub mod config;
pub mod error;
pub mod fetch;
pub mod platform;
pub mod protocol;
pub mod resolve;
pub mod schedule;
pub mod state;
pub mod store;
