pub mod types;
pub mod error;
pub mod data;
pub mod broker;
pub mod config;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use types::*;
pub use error::{Result, SyncError};
