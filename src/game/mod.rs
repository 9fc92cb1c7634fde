//! Match model and the background machinery that drives running matches

pub mod engine;
pub mod model;
pub mod physics;
pub mod scheduler;
pub mod snapshot;
pub mod votes;
