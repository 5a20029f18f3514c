use anyhow::{Context, Result};
use glam::Mat4;
use wgpu::util::DeviceExt;

use super::animation_runner::GpuAnimationRunner;
use super::gpu_context::GpuContext;
use crate::config::SpriteMeshConfig;
use crate::instanced_sprite::InstancedSpriteMesh;
use crate::mesh::{SpriteGeometry, SpriteInstanceTransform, SpriteVertex};
use crate::shader::{
    PatchedShader, SpriteGlobalsUniform, SpriteInstanceRecord, SpriteShaderOptions, SpriteShaderPatcher,
    SurfaceShader,
};

/// Bind group index of the sprite resources; groups 0 and 1 hold the camera and the atlas.
pub const SPRITE_BIND_GROUP: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraUniform {
    view: [[f32; 4]; 4],
    proj: [[f32; 4]; 4],
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct SpriteBindKey {
    table_generation: u64,
    params_generation: u64,
}

/// Draws every instance of one [`InstancedSpriteMesh`] with a single instanced call.
pub struct SpritePass {
    context: GpuContext,
    patched: PatchedShader,
    pipeline: wgpu::RenderPipeline,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
    camera_buf: wgpu::Buffer,
    camera_bg: wgpu::BindGroup,
    atlas_bgl: wgpu::BindGroupLayout,
    atlas_bg: Option<wgpu::BindGroup>,
    sampler: wgpu::Sampler,
    sprite_bgl: wgpu::BindGroupLayout,
    sprite_key: Option<SpriteBindKey>,
    // One per runner state texture.
    sprite_bgs: [Option<wgpu::BindGroup>; 2],
    sprite_current: usize,
    bind_group_builds: u64,
    globals_buf: wgpu::Buffer,
    instance_buffer: Option<wgpu::Buffer>,
    params_buffer: Option<wgpu::Buffer>,
    instance_capacity: usize,
    params_generation: u64,
    instance_count: u32,
}

impl SpritePass {
    /// `surface` must bind its camera at group 0 and its atlas texture and sampler at group 1,
    /// like `sprite_unlit.wgsl`. The mesh and clip mode come from `config.geometry`.
    pub fn new(
        context: &GpuContext,
        target_format: wgpu::TextureFormat,
        surface: &SurfaceShader,
        config: &SpriteMeshConfig,
    ) -> Result<Self> {
        let device = &context.device;
        let geometry = config.geometry;
        let patcher = SpriteShaderPatcher::new(SpriteShaderOptions { bind_group: SPRITE_BIND_GROUP, geometry });
        let patched = patcher.patch(surface);
        if !patched.vertex_hooked || patched.replaced_uv_refs == 0 {
            log::warn!(
                "[shader] surface shader only partially patched (vertex hooked: {}, uv refs: {})",
                patched.vertex_hooked,
                patched.replaced_uv_refs
            );
        }
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Sprite Shader"),
            source: wgpu::ShaderSource::Wgsl(patched.source.as_str().into()),
        });

        let camera_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sprite Camera BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let camera_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sprite Camera Buffer"),
            contents: bytemuck::bytes_of(&CameraUniform {
                view: Mat4::IDENTITY.to_cols_array_2d(),
                proj: Mat4::IDENTITY.to_cols_array_2d(),
            }),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let camera_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sprite Camera BG"),
            layout: &camera_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: camera_buf.as_entire_binding() }],
        });

        let atlas_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sprite Atlas BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Sprite Atlas Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let sprite_bgl = sprite_bind_group_layout(device);
        let globals_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Globals Buffer"),
            size: std::mem::size_of::<SpriteGlobalsUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let geometry = SpriteGeometry::new(geometry);
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sprite VB"),
            contents: bytemuck::cast_slice(&geometry.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        // Pad to a 4-byte multiple for the 3-index triangle.
        let mut indices = geometry.indices.clone();
        if indices.len() % 2 == 1 {
            indices.push(0);
        }
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sprite IB"),
            contents: bytemuck::cast_slice(&indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Sprite Pipeline Layout"),
            bind_group_layouts: &[&camera_bgl, &atlas_bgl, &sprite_bgl],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Sprite Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some(surface.vertex_entry.as_str()),
                buffers: &[SpriteVertex::layout(), SpriteInstanceTransform::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some(surface.fragment_entry.as_str()),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState { topology: wgpu::PrimitiveTopology::TriangleList, ..Default::default() },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(anyhow::anyhow!("sprite pipeline rejected: {error}"));
        }

        Ok(Self {
            context: context.clone(),
            patched,
            pipeline,
            vertex_buffer,
            index_buffer,
            index_count: geometry.index_count(),
            camera_buf,
            camera_bg,
            atlas_bgl,
            atlas_bg: None,
            sampler,
            sprite_bgl,
            sprite_key: None,
            sprite_bgs: [None, None],
            sprite_current: 0,
            bind_group_builds: 0,
            globals_buf,
            instance_buffer: None,
            params_buffer: None,
            instance_capacity: 0,
            params_generation: 0,
            instance_count: 0,
        })
    }

    pub fn patched_shader(&self) -> &PatchedShader {
        &self.patched
    }

    /// Sprite data bind groups created so far.
    pub fn bind_group_builds(&self) -> u64 {
        self.bind_group_builds
    }

    pub fn write_camera(&self, view: Mat4, proj: Mat4) {
        let camera = CameraUniform { view: view.to_cols_array_2d(), proj: proj.to_cols_array_2d() };
        self.context.queue.write_buffer(&self.camera_buf, 0, bytemuck::bytes_of(&camera));
    }

    pub fn set_atlas(&mut self, atlas_view: &wgpu::TextureView) {
        self.atlas_bg = Some(self.context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sprite Atlas Bind Group"),
            layout: &self.atlas_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(atlas_view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&self.sampler) },
            ],
        }));
    }

    /// Uploads an RGBA8 atlas image and binds it.
    pub fn upload_atlas(&mut self, image: &image::RgbaImage) -> wgpu::Texture {
        let (width, height) = image.dimensions();
        let texture = self.context.device.create_texture_with_data(
            &self.context.queue,
            &wgpu::TextureDescriptor {
                label: Some("Sprite Atlas"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8UnormSrgb,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            image.as_raw(),
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.set_atlas(&view);
        texture
    }

    /// Pushes per-frame sprite data: globals always, params and transforms when dirty.
    pub fn prepare(&mut self, sprites: &mut InstancedSpriteMesh<GpuAnimationRunner>) -> Result<()> {
        let count = sprites.count();
        self.context.queue.write_buffer(&self.globals_buf, 0, bytemuck::bytes_of(&sprites.globals_uniform()));
        let grew = self.ensure_instance_capacity(count);
        let dirty = sprites.take_render_dirty();
        if dirty.transforms || grew {
            let transforms: Vec<SpriteInstanceTransform> = sprites
                .transforms()
                .iter()
                .map(|matrix| SpriteInstanceTransform { model: matrix.to_cols_array_2d() })
                .collect();
            let buffer = self.instance_buffer.as_ref().context("Instance buffer missing")?;
            self.context.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&transforms));
        }
        if dirty.params || grew {
            let buffer = self.params_buffer.as_ref().context("Sprite params buffer missing")?;
            self.context.queue.write_buffer(buffer, 0, bytemuck::cast_slice(sprites.instance_records()));
        }
        self.instance_count = count as u32;

        let runner = sprites.runner();
        let key =
            SpriteBindKey { table_generation: runner.table_generation(), params_generation: self.params_generation };
        if self.sprite_key != Some(key) {
            self.sprite_key = Some(key);
            self.sprite_bgs = [None, None];
        }
        let index = runner.current_index() % 2;
        self.sprite_current = index;
        if self.sprite_bgs[index].is_some() {
            return Ok(());
        }
        let Some(data_view) = runner.spritesheet_view() else {
            self.sprite_key = None;
            return Ok(());
        };
        let params = self.params_buffer.as_ref().context("Sprite params buffer missing")?;
        let bind_group = self.context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sprite Data Bind Group"),
            layout: &self.sprite_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.globals_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: params.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(runner.state_view(index)),
                },
                wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::TextureView(data_view) },
            ],
        });
        self.sprite_bgs[index] = Some(bind_group);
        self.bind_group_builds += 1;
        Ok(())
    }

    pub fn encode_pass(&self, pass: &mut wgpu::RenderPass<'_>) -> Result<()> {
        if self.instance_count == 0 {
            return Ok(());
        }
        let sprite_bg = self.sprite_bgs[self.sprite_current]
            .as_ref()
            .context("Sprite data bind group missing; call prepare first")?;
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.camera_bg, &[]);
        pass.set_bind_group(1, self.atlas_bg.as_ref().context("Sprite atlas missing")?, &[]);
        pass.set_bind_group(SPRITE_BIND_GROUP, sprite_bg, &[]);
        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        let instance_buffer = self.instance_buffer.as_ref().context("Instance buffer missing")?;
        pass.set_vertex_buffer(1, instance_buffer.slice(..));
        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..self.index_count, 0, 0..self.instance_count);
        Ok(())
    }

    /// Clears `target` and draws the prepared sprites into it.
    pub fn render(&self, target: &wgpu::TextureView, clear: wgpu::Color) -> Result<()> {
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Sprite Encoder") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Sprite Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(clear), store: wgpu::StoreOp::Store },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.encode_pass(&mut pass)?;
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Returns true when the per-instance buffers were reallocated.
    fn ensure_instance_capacity(&mut self, count: usize) -> bool {
        let required = count.max(1);
        if self.instance_capacity >= required && self.instance_buffer.is_some() && self.params_buffer.is_some() {
            return false;
        }
        let mut new_cap = self.instance_capacity.max(256);
        while new_cap < required {
            new_cap *= 2;
        }
        let device = &self.context.device;
        self.instance_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Instance Buffer"),
            size: (new_cap * std::mem::size_of::<SpriteInstanceTransform>()) as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        self.params_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Params Buffer"),
            size: (new_cap * std::mem::size_of::<SpriteInstanceRecord>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        self.instance_capacity = new_cap;
        self.params_generation += 1;
        true
    }
}

/// Layout of the sprite bind group declared by `sprite_patch.wgsl`.
pub fn sprite_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let stages = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
    let data_texture = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: stages,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    };
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Sprite Data BGL"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: stages,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<SpriteGlobalsUniform>() as u64),
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: stages,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            data_texture(2),
            data_texture(3),
        ],
    })
}
