//! Backend — async seam to the durable collections.
//!
//! ARCHITECTURE
//! ============
//! The sync core persists five collections: `shapes`, `layers`, `locks`,
//! `scale` (a singleton) and `presence`. A `Backend` is one session's handle
//! onto them plus the change feed that fans every accepted write out to all
//! subscribers. Transport is the implementor's business; [`crate::memory`]
//! provides an in-process one.
//!
//! ERROR HANDLING
//! ==============
//! Network-class failures (`Unavailable`, `Timeout`) are retryable and the
//! sync worker retries them indefinitely. `Rejected` is terminal for that
//! write. Lock contention is not an error: `swap_lock` reports a lost race
//! as `Ok(false)`.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::change::{ChangeEvent, ClientId, ErrorCode};
use crate::lock::Lease;
use crate::presence::PresenceEntry;
use crate::scale::ScaleLine;
use crate::shape::{Layer, LayerId, Shape, ShapeId, UserId};
use crate::store::Snapshot;

/// Error returned by backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timed out")]
    Timeout,
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl ErrorCode for BackendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_BACKEND_UNAVAILABLE",
            Self::Timeout => "E_BACKEND_TIMEOUT",
            Self::Rejected(_) => "E_BACKEND_REJECTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// One session's handle onto the durable collections.
///
/// Every successful write must be re-broadcast on the change feed with
/// `origin == client_id()`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identifies this handle's writes on the change feed.
    fn client_id(&self) -> &ClientId;

    // --- shapes ---

    /// Upsert full shape records. The backend assigns `updated_at`.
    async fn put_shapes(&self, shapes: &[Shape]) -> Result<(), BackendError>;

    async fn delete_shapes(&self, ids: &[ShapeId], deleted_at: i64) -> Result<(), BackendError>;

    async fn load_shapes(&self) -> Result<Vec<Shape>, BackendError>;

    // --- layers ---

    async fn put_layer(&self, layer: &Layer) -> Result<(), BackendError>;

    async fn delete_layer(&self, id: &LayerId) -> Result<(), BackendError>;

    async fn load_layers(&self) -> Result<Vec<Layer>, BackendError>;

    // --- scale ---

    /// Replace the canvas's calibration line, or clear it with `None`.
    async fn put_scale(&self, line: Option<&ScaleLine>) -> Result<(), BackendError>;

    async fn load_scale(&self) -> Result<Option<ScaleLine>, BackendError>;

    // --- locks ---

    async fn get_lock(&self, shape_id: &ShapeId) -> Result<Option<Lease>, BackendError>;

    async fn list_locks(&self) -> Result<Vec<Lease>, BackendError>;

    /// Compare-and-swap the lease for `shape_id`: replace it with `new` only
    /// if the stored lease equals `expected`. Returns whether the swap happened.
    async fn swap_lock(
        &self,
        shape_id: &ShapeId,
        expected: Option<&Lease>,
        new: Option<&Lease>,
    ) -> Result<bool, BackendError>;

    // --- presence ---

    async fn put_presence(&self, entry: &PresenceEntry) -> Result<(), BackendError>;

    async fn delete_presence(&self, user_id: &UserId, view: &str) -> Result<(), BackendError>;

    async fn list_presence(&self) -> Result<Vec<PresenceEntry>, BackendError>;

    // --- feed ---

    /// Open a fresh change-feed receiver. Dropping it unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Full durable state of the canvas.
    async fn load_snapshot(&self) -> Result<Snapshot, BackendError> {
        Ok(Snapshot {
            shapes: self.load_shapes().await?,
            layers: self.load_layers().await?,
            scale_line: self.load_scale().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(BackendError::Unavailable("offline".into()).retryable());
        assert!(BackendError::Timeout.retryable());
        assert!(!BackendError::Rejected("schema".into()).retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(BackendError::Timeout.error_code(), "E_BACKEND_TIMEOUT");
        assert_eq!(BackendError::Unavailable(String::new()).error_code(), "E_BACKEND_UNAVAILABLE");
        assert_eq!(BackendError::Rejected(String::new()).error_code(), "E_BACKEND_REJECTED");
        assert_eq!(BackendError::Rejected("bad".into()).to_string(), "write rejected: bad");
    }
}
