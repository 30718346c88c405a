//! Change — the universal fan-out message between canvas sessions.
//!
//! ARCHITECTURE
//! ============
//! Every write a backend accepts is re-broadcast to all subscribers as a
//! `ChangeEvent`. Sessions never talk to each other directly; the change
//! feed is the only cross-session ordering mechanism.
//!
//! DESIGN
//! ======
//! - `origin` is the writing session's client id, so a session can tell its
//!   own echoed writes from genuinely remote ones.
//! - `seq` is assigned by the backend and is monotonic per backend. It
//!   reflects arrival order only; conflict resolution uses the client stamp
//!   carried inside each shape record instead.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lock::Lease;
use crate::presence::PresenceEntry;
use crate::scale::ScaleLine;
use crate::shape::{Layer, LayerId, Shape, ShapeId, UserId};

/// Identifies one open session against a backend.
pub type ClientId = String;

// =============================================================================
// TYPES
// =============================================================================

/// Persistent collections a change can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Shapes,
    Layers,
    Locks,
    Scale,
    Presence,
}

/// Payload of a change event. Shape writes carry full records, never field
/// diffs, so receivers can merge at shape granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    ShapesUpserted { shapes: Vec<Shape> },
    ShapesDeleted { ids: Vec<ShapeId>, deleted_at: i64 },
    LayerUpserted { layer: Layer },
    LayerDeleted { id: LayerId },
    LockChanged { shape_id: ShapeId, lease: Option<Lease> },
    ScaleChanged { line: Option<ScaleLine> },
    PresenceChanged { entry: PresenceEntry },
    PresenceLeft { user_id: UserId, view: String },
}

impl Change {
    #[must_use]
    pub fn collection(&self) -> Collection {
        match self {
            Self::ShapesUpserted { .. } | Self::ShapesDeleted { .. } => Collection::Shapes,
            Self::LayerUpserted { .. } | Self::LayerDeleted { .. } => Collection::Layers,
            Self::LockChanged { .. } => Collection::Locks,
            Self::ScaleChanged { .. } => Collection::Scale,
            Self::PresenceChanged { .. } | Self::PresenceLeft { .. } => Collection::Presence,
        }
    }
}

/// Envelope delivered on the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    /// Backend arrival order.
    pub seq: u64,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    pub origin: ClientId,
    pub change: Change,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(origin: impl Into<ClientId>, seq: u64, change: Change) -> Self {
        Self { id: Uuid::new_v4(), seq, ts: now_ms(), origin: origin.into(), change }
    }

    /// True when this event is the echo of a write made by `client_id`.
    #[must_use]
    pub fn is_echo_for(&self, client_id: &str) -> bool {
        self.origin == client_id
    }

    #[must_use]
    pub fn collection(&self) -> Collection {
        self.change.collection()
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "change_test.rs"]
mod tests;
