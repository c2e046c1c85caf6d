//! Protocol Stack Layers Library
//!
//! This crate implements the 5G NR MAC scheduling layer according to 3GPP Release 16.

pub mod mac;

use async_trait::async_trait;
use thiserror::Error;

pub use mac::MacError;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Layer not initialized")]
    NotInitialized,

    #[error("MAC error: {0}")]
    Mac(#[from] MacError),
}

/// Common trait for all protocol layers
#[async_trait]
pub trait ProtocolLayer: Send + Sync {
    /// Initialize the layer
    async fn initialize(&mut self) -> Result<(), LayerError>;

    /// Shutdown the layer
    async fn shutdown(&mut self) -> Result<(), LayerError>;
}
