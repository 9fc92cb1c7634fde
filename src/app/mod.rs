//! Per-process application wiring

pub mod state;

pub use state::AppState;

#[cfg(test)]
pub(crate) mod test_support;
