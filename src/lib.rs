pub mod config;
pub mod encoder;
pub mod instanced_sprite;
pub mod instructions;
pub mod mesh;
pub mod playback;
pub mod renderer;
pub mod shader;
pub mod spritesheet;
pub mod time;

pub use config::{SpriteGeometryKind, SpriteMeshConfig};
pub use encoder::EncodedSpritesheet;
pub use instanced_sprite::InstancedSpriteMesh;
pub use instructions::{Instruction, InstructionBuffer, PlayMode};
pub use playback::{CpuAnimationRunner, PlaybackRunner, PlaybackState, RunnerUniforms};
pub use shader::{SpriteShaderOptions, SpriteShaderPatcher, SurfaceShader, TintHsv};
pub use spritesheet::{AnimationFrame, FrameRect, SpritesheetFormat};
