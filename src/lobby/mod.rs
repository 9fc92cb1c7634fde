//! Lobby lifecycle and player actions

pub mod service;

pub use service::{FuelAction, MatchService};
