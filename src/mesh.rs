use crate::config::SpriteGeometryKind;
use glam::{Vec2, Vec3};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpriteVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

impl SpriteVertex {
    pub fn new(position: Vec3, uv: Vec2) -> Self {
        Self { position: position.to_array(), uv: uv.to_array() }
    }

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<SpriteVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x2 },
            ],
        }
    }
}

/// Per-instance model matrix, columns at shader locations 2..=5.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpriteInstanceTransform {
    pub model: [[f32; 4]; 4],
}

impl SpriteInstanceTransform {
    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<SpriteInstanceTransform>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &[
                wgpu::VertexAttribute { offset: 0, shader_location: 2, format: wgpu::VertexFormat::Float32x4 },
                wgpu::VertexAttribute { offset: 16, shader_location: 3, format: wgpu::VertexFormat::Float32x4 },
                wgpu::VertexAttribute { offset: 32, shader_location: 4, format: wgpu::VertexFormat::Float32x4 },
                wgpu::VertexAttribute { offset: 48, shader_location: 5, format: wgpu::VertexFormat::Float32x4 },
            ],
        }
    }
}

/// Mesh drawn once per sprite instance. UV origin is the top-left corner.
#[derive(Clone, Debug, PartialEq)]
pub struct SpriteGeometry {
    pub kind: SpriteGeometryKind,
    pub vertices: Vec<SpriteVertex>,
    pub indices: Vec<u16>,
}

impl SpriteGeometry {
    pub fn new(kind: SpriteGeometryKind) -> Self {
        match kind {
            SpriteGeometryKind::Quad => Self::quad(),
            SpriteGeometryKind::Tri => Self::tri(),
        }
    }

    /// Unit quad centered on the origin.
    pub fn quad() -> Self {
        let vertices = vec![
            SpriteVertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec2::new(0.0, 0.0)),
            SpriteVertex::new(Vec3::new(0.5, 0.5, 0.0), Vec2::new(1.0, 0.0)),
            SpriteVertex::new(Vec3::new(0.5, -0.5, 0.0), Vec2::new(1.0, 1.0)),
            SpriteVertex::new(Vec3::new(-0.5, -0.5, 0.0), Vec2::new(0.0, 1.0)),
        ];
        Self { kind: SpriteGeometryKind::Quad, vertices, indices: vec![0, 1, 2, 0, 2, 3] }
    }

    /// Single triangle enclosing a unit sprite in its lower half; fewer vertices than a
    /// quad at the cost of clipped fragments.
    pub fn tri() -> Self {
        let vertices = vec![
            SpriteVertex::new(Vec3::new(0.0, 1.0, 0.0), Vec2::new(0.5, 0.0)),
            SpriteVertex::new(Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 1.0)),
            SpriteVertex::new(Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 1.0)),
        ];
        Self { kind: SpriteGeometryKind::Tri, vertices, indices: vec![0, 1, 2] }
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}
