//! Geometry utilities: rigid transforms, SO(3) helpers, triangulation.

pub mod se3;
pub mod so3;
pub mod triangulation;

pub use se3::SE3;
pub use so3::skew;
pub use triangulation::triangulate;
