//! Common Utilities and Types Library
//! 
//! This crate provides shared types and utilities used by the MAC scheduler and the gNB driver.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
