//! The map graph: keyframes, landmarks and their relations.
//!
//! Both entity kinds are owned by the [`Map`] arena and cross-reference each
//! other through stable ids, so the cyclic KF ↔ MP structure needs no
//! reference counting. Entities removed from the graph stay in the arena as
//! bad-flagged tombstones; graph queries skip them while direct lookups (and
//! the `replaced_by` forwarding chain) keep resolving.

pub mod atlas;
pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use atlas::Atlas;
pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
