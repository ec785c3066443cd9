//! Engine-agnostic primitives.
//!
//! Nothing in this module touches sockets or session state.

pub mod time;
pub mod vec3;

// Re-export core types
pub use time::now_millis;
pub use vec3::Vec3;
