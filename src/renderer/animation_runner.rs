//! GPU backend of [`PlaybackRunner`]: one compute invocation per instance cell.

use super::gpu_context::GpuContext;
use crate::encoder::EncodedSpritesheet;
use crate::instructions::InstructionBuffer;
use crate::playback::{AnimationGrid, PlaybackRunner, PlaybackState, RunnerUniforms};
use anyhow::{anyhow, Context, Result};
use std::ops::Range;
use std::sync::{mpsc, Arc};

pub const WORKGROUP_SIZE: u32 = 8;
const TEXEL_BYTES: u32 = 16;
const STATE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelUniforms {
    fps: f32,
    delta_time: f32,
    grid_side: u32,
    _pad: u32,
}

struct TableTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

pub struct GpuAnimationRunner {
    context: GpuContext,
    grid: AnimationGrid,
    pipeline: Option<wgpu::ComputePipeline>,
    layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    instruction_texture: wgpu::Texture,
    instruction_view: wgpu::TextureView,
    state_textures: [wgpu::Texture; 2],
    state_views: [wgpu::TextureView; 2],
    table: Option<TableTexture>,
    bind_groups: Option<[wgpu::BindGroup; 2]>,
    current: usize,
    table_generation: u64,
    ticks: u64,
    degraded: Option<String>,
}

impl GpuAnimationRunner {
    /// Never fails: an unusable device or an oversized grid leaves the runner degraded,
    /// in which case [`PlaybackRunner::compute`] does nothing.
    pub fn new(context: &GpuContext, instance_count: u32) -> Self {
        let device = &context.device;
        let grid = AnimationGrid::for_instances(instance_count);
        let max_side = context.max_texture_side();
        let mut degraded = None;
        if grid.side() > max_side {
            degraded = Some(format!(
                "{} instances need a {}x{} state grid but the device allows {}",
                instance_count,
                grid.side(),
                grid.side(),
                max_side
            ));
        }
        // Degraded runners still own minimal resources so the sprite pass can bind them.
        let side = if degraded.is_some() { 1 } else { grid.side() };

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Animation Runner Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<KernelUniforms>() as u64),
                    },
                    count: None,
                },
                sampled_entry(1),
                sampled_entry(2),
                sampled_entry(3),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: STATE_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Animation Runner Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/animation_runner.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Animation Runner Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Animation Runner Pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("cs_main"),
            compilation_options: Default::default(),
            cache: None,
        });
        let pipeline = match pollster::block_on(device.pop_error_scope()) {
            Some(error) => {
                degraded.get_or_insert_with(|| format!("compute pipeline rejected: {error}"));
                None
            }
            None => Some(pipeline),
        };
        if let Some(reason) = &degraded {
            log::error!("[runner] GPU playback disabled, {reason}");
        }

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Animation Runner Uniforms"),
            size: std::mem::size_of::<KernelUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let instruction_texture = create_grid_texture(
            device,
            "Animation Instructions",
            side,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let instruction_view = instruction_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let state_usage = wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC;
        let state_textures = [
            create_grid_texture(device, "Animation State A", side, state_usage),
            create_grid_texture(device, "Animation State B", side, state_usage),
        ];
        let state_views = [
            state_textures[0].create_view(&wgpu::TextureViewDescriptor::default()),
            state_textures[1].create_view(&wgpu::TextureViewDescriptor::default()),
        ];

        Self {
            context: context.clone(),
            grid,
            pipeline,
            layout,
            uniform_buffer,
            instruction_texture,
            instruction_view,
            state_textures,
            state_views,
            table: None,
            bind_groups: None,
            current: 0,
            table_generation: 0,
            ticks: 0,
            degraded,
        }
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Index of the state texture written by the latest tick; flips every compute.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// One of the two ping-pong state textures; `index` is taken modulo 2.
    pub fn state_view(&self, index: usize) -> &wgpu::TextureView {
        &self.state_views[index % 2]
    }

    pub fn spritesheet_view(&self) -> Option<&wgpu::TextureView> {
        self.table.as_ref().map(|table| &table.view)
    }

    pub fn spritesheet_size(&self) -> Option<(u32, u32)> {
        self.table.as_ref().map(|table| (table.width, table.height))
    }

    /// Bumped every time a spritesheet is bound.
    pub fn table_generation(&self) -> u64 {
        self.table_generation
    }

    /// Blocking copy of the latest state texture, in instance order.
    pub fn read_back_states(&self) -> Result<Vec<PlaybackState>> {
        if self.degraded.is_some() {
            return Err(anyhow!("GPU playback is degraded, no state to read"));
        }
        let device = &self.context.device;
        let side = self.grid.side();
        let unpadded = side * TEXEL_BYTES;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Animation State Readback"),
            size: u64::from(padded) * u64::from(side),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Animation State Copy") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.state_textures[self.current],
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(side),
                },
            },
            grid_extent(side, side),
        );
        self.context.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::PollType::wait_indefinitely()).context("Failed to poll device for state readback")?;
        rx.recv().context("State readback callback dropped")?.context("Failed to map state readback buffer")?;

        let count = self.grid.instance_count() as usize;
        let mut states = Vec::with_capacity(count);
        {
            let mapped = slice.get_mapped_range();
            for row in 0..side as usize {
                let start = row * padded as usize;
                let texels: &[[f32; 4]] = bytemuck::cast_slice(&mapped[start..start + unpadded as usize]);
                for texel in texels {
                    if states.len() == count {
                        break;
                    }
                    states.push(PlaybackState::from_array(*texel));
                }
            }
        }
        staging.unmap();
        Ok(states)
    }

    fn rebuild_bind_groups(&mut self) {
        let Some(table) = &self.table else {
            self.bind_groups = None;
            return;
        };
        let device = &self.context.device;
        let make = |read: usize, write: usize, label: &'static str| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: self.uniform_buffer.as_entire_binding() },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&self.instruction_view),
                    },
                    wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(&table.view) },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(&self.state_views[read]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::TextureView(&self.state_views[write]),
                    },
                ],
            })
        };
        let groups = [make(0, 1, "Animation Runner A->B"), make(1, 0, "Animation Runner B->A")];
        self.bind_groups = Some(groups);
    }
}

impl PlaybackRunner for GpuAnimationRunner {
    fn grid(&self) -> AnimationGrid {
        self.grid
    }

    fn set_spritesheet(&mut self, table: Arc<EncodedSpritesheet>) {
        let (width, height) = (table.width(), table.height());
        let max_side = self.context.max_texture_side();
        if width > max_side || height > max_side {
            log::error!(
                "[runner] spritesheet table {width}x{height} exceeds device limit {max_side}, keeping previous table"
            );
            return;
        }
        let device = &self.context.device;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Spritesheet Data"),
            size: grid_extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STATE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            table.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(TEXEL_BYTES * width),
                rows_per_image: Some(height),
            },
            grid_extent(width, height),
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.table = Some(TableTexture { _texture: texture, view, width, height });
        self.table_generation += 1;
        self.rebuild_bind_groups();
        log::debug!(
            "[runner] bound spritesheet table {width}x{height} with {} animations",
            table.animation_count()
        );
    }

    fn upload_instructions(&mut self, instructions: &InstructionBuffer, range: Range<usize>) {
        if self.degraded.is_some() {
            return;
        }
        let side = self.grid.side();
        let rows = self.grid.rows_for(&range);
        if rows.is_empty() {
            return;
        }
        let records = instructions.as_slice();
        let mut staging = vec![[0.0_f32; 4]; (rows.len() as u32 * side) as usize];
        let first = (rows.start * side) as usize;
        let last = ((rows.end * side) as usize).min(records.len());
        if first < last {
            staging[..last - first].copy_from_slice(&records[first..last]);
        }
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.instruction_texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: rows.start, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&staging),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(TEXEL_BYTES * side),
                rows_per_image: Some(rows.len() as u32),
            },
            grid_extent(side, rows.len() as u32),
        );
    }

    fn compute(&mut self, uniforms: RunnerUniforms) {
        if self.degraded.is_some() {
            return;
        }
        let (Some(pipeline), Some(bind_groups)) = (&self.pipeline, &self.bind_groups) else {
            log::debug!("[runner] no spritesheet bound, skipping tick");
            return;
        };
        let kernel = KernelUniforms {
            fps: uniforms.fps,
            delta_time: uniforms.delta_time,
            grid_side: self.grid.side(),
            _pad: 0,
        };
        self.context.queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&kernel));
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Animation Runner Encoder") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Animation Runner Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_groups[self.current], &[]);
            let groups = self.grid.workgroups(WORKGROUP_SIZE);
            pass.dispatch_workgroups(groups, groups, 1);
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));
        self.current = 1 - self.current;
        self.ticks += 1;
    }

    fn state(&self, _instance: usize) -> Option<PlaybackState> {
        None
    }

    fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

fn sampled_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn grid_extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d { width, height, depth_or_array_layers: 1 }
}

fn create_grid_texture(device: &wgpu::Device, label: &str, side: u32, usage: wgpu::TextureUsages) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: grid_extent(side, side),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: STATE_FORMAT,
        usage,
        view_formats: &[],
    })
}
