//! Error types for the transport layer

use std::time::Duration;

use thiserror::Error;

use rnsble_core::{BleAddress, FragmentError};

use crate::driver::DriverError;

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the transport's own operations.
///
/// Most radio-side failures are absorbed internally (recorded against the
/// peer, escalated toward the blacklist); this type covers the calls the
/// embedder makes directly, such as startup and shutdown.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("transport is offline")]
    Offline,

    #[error("handshake with {address} failed: {reason}")]
    HandshakeFailed { address: BleAddress, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Fragment(#[from] FragmentError),
}
