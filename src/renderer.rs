//! GPU side of the sprite system: device setup, the playback compute runner,
//! and the instanced sprite render pass.

pub mod animation_runner;
pub mod gpu_context;
pub mod sprite_pass;

pub use crate::mesh::{SpriteGeometry, SpriteInstanceTransform, SpriteVertex};
pub use animation_runner::GpuAnimationRunner;
pub use gpu_context::GpuContext;
pub use sprite_pass::SpritePass;
