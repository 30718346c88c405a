//! Shared-state synchronization core for the collaborative takeoff canvas.
//!
//! Many users create, move, resize and annotate shapes on one drawing
//! surface. Each open canvas gets a [`session::CanvasSession`] that owns the
//! local [`store::ShapeStore`], leases shapes through the
//! [`lock::LockManager`], and mirrors every edit to a durable
//! [`backend::Backend`] through the [`sync::SyncBridge`].
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`scale`] | Pixel → real-world conversions from a calibration line |
//! | [`throttle`] | Leading, coalescing and adaptive rate limiters |
//! | [`shape`] | Shape and layer records |
//! | [`store`] | In-memory canvas state with last-writer-wins merge |
//! | [`change`] | Change-feed envelope shared by every backend |
//! | [`backend`] | Async seam to the persistent collections |
//! | [`memory`] | In-process backend with broadcast fan-out |
//! | [`lock`] | Per-shape leases |
//! | [`sync`] | Outbound publish worker, inbound feed, reconciliation |
//! | [`presence`] | Advisory "who is here" roster |
//! | [`session`] | Per-canvas composition of all of the above |
//! | [`config`] | Tunables loaded from the environment |

pub mod backend;
pub mod change;
pub mod config;
pub mod lock;
pub mod memory;
pub mod presence;
pub mod scale;
pub mod session;
pub mod shape;
pub mod store;
pub mod sync;
pub mod throttle;
