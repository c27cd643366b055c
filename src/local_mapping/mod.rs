//! The local mapping thread.
//!
//! Sits between the tracker and the loop closer: drains the incoming
//! keyframe queue, grows and prunes the map around each new keyframe, runs
//! local bundle adjustment, and bootstraps the inertial state when an IMU is
//! present.

pub mod imu_init;
pub mod keyframe_culling;
pub mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use keyframe_culling::keyframe_culling;
pub use local_mapper::{LocalMapper, LocalMappingHandle};
pub use search_in_neighbors::search_in_neighbors;
pub use triangulation::create_new_map_points;
