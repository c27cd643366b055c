//! Cross-thread plumbing: messages, shared flags, and the interfaces of the
//! collaborating front- and back-end threads.

pub mod messages;
pub mod shared_state;

use crate::imu::ImuBias;
use crate::map::KeyFrameId;

pub use messages::KeyFrameData;
pub use shared_state::SharedState;

/// Tracking thread state as observed by the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Ok,
    RecentlyLost,
    Lost,
}

/// Feedback channel into the tracking thread.
///
/// The mapper reads the tracker's health to steer optimization windows and
/// pushes corrected IMU state back after inertial (re-)initialization.
pub trait TrackerLink: Send + Sync {
    /// Inlier count of the tracker's last frame-to-map match.
    fn matches_inliers(&self) -> u32;

    fn state(&self) -> TrackingState;

    /// Propagate a scale/bias correction anchored at `anchor_kf` into the
    /// tracker's frame state.
    fn update_frame_imu(&self, scale: f64, bias: ImuBias, anchor_kf: KeyFrameId);
}

/// A tracker stand-in for purely visual operation: healthy, zero feedback.
pub struct DetachedTracker;

impl TrackerLink for DetachedTracker {
    fn matches_inliers(&self) -> u32 {
        0
    }

    fn state(&self) -> TrackingState {
        TrackingState::Ok
    }

    fn update_frame_imu(&self, _scale: f64, _bias: ImuBias, _anchor_kf: KeyFrameId) {}
}
