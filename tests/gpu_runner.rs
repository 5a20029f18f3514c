use glam::{Mat4, Vec3};
use instanced_sprites::playback::CpuAnimationRunner;
use instanced_sprites::renderer::{GpuAnimationRunner, GpuContext, SpritePass};
use instanced_sprites::{
    AnimationFrame, FrameRect, InstancedSpriteMesh, PlayMode, PlaybackRunner, SpriteGeometryKind, SpriteMeshConfig,
    SpritesheetFormat, SurfaceShader, TintHsv,
};

const INSTANCES: u32 = 20;

fn sheet() -> SpritesheetFormat {
    let frames = (0..8).map(|i| FrameRect::new(i as f32 / 8.0, 0.0, 1.0 / 8.0, 1.0)).collect();
    let mut sheet = SpritesheetFormat::new(frames, [256, 32]);
    sheet.push_animation("idle", (0..3).map(|i| AnimationFrame::new(i, 1.0)).collect());
    sheet.push_animation("run", (3..8).map(|i| AnimationFrame::new(i, 1.0)).collect());
    sheet
}

fn config() -> SpriteMeshConfig {
    SpriteMeshConfig { fps: 10.0, ..SpriteMeshConfig::default() }
}

fn headless() -> Option<GpuContext> {
    match GpuContext::headless() {
        Ok(context) => Some(context),
        Err(err) => {
            eprintln!("skipping GPU test: {err:?}");
            None
        }
    }
}

fn script<R: PlaybackRunner>(mesh: &mut InstancedSpriteMesh<R>) {
    mesh.play("run", true, PlayMode::Forward).all();
    mesh.play("run", true, PlayMode::Reverse).at(1);
    mesh.play("run", true, PlayMode::PingPong).at(2);
    mesh.play("run", false, PlayMode::Forward).at(3);
    mesh.play("run", true, PlayMode::Pause).at(4);
    mesh.set_frame_at(5, 2);
    mesh.set_offset_at(6, 0.015);
    mesh.play("idle", true, PlayMode::Pause).at(7);
}

fn resume_run<R: PlaybackRunner>(mesh: &mut InstancedSpriteMesh<R>, id: usize) {
    mesh.set_animation_at(id, "run");
    mesh.set_playmode_at(id, PlayMode::Forward);
}

#[test]
fn gpu_kernel_matches_cpu_reference() {
    let Some(context) = headless() else {
        return;
    };
    let runner = GpuAnimationRunner::new(&context, INSTANCES);
    if let Some(reason) = runner.degraded_reason() {
        eprintln!("skipping GPU test: {reason}");
        return;
    }
    let mut gpu = InstancedSpriteMesh::new(runner, config());
    let mut cpu = InstancedSpriteMesh::<CpuAnimationRunner>::cpu(INSTANCES, config());
    gpu.set_spritesheet(sheet()).expect("gpu spritesheet");
    cpu.set_spritesheet(sheet()).expect("cpu spritesheet");
    assert_eq!(gpu.runner().spritesheet_size(), Some((8, 4)));
    script(&mut gpu);
    script(&mut cpu);

    for tick in 0..9 {
        if tick == 4 {
            resume_run(&mut gpu, 7);
            resume_run(&mut cpu, 7);
        }
        // 0.11s steps keep every sampled phase clear of a frame boundary.
        gpu.update_with_delta(0.11);
        cpu.update_with_delta(0.11);
        let actual = gpu.runner().read_back_states().expect("read back states");
        let expected = cpu.runner().states();
        assert_eq!(actual.len(), expected.len());
        for (id, (gpu_state, cpu_state)) in actual.iter().zip(expected).enumerate() {
            assert_eq!(gpu_state.frame, cpu_state.frame, "tick {tick} instance {id}");
            assert_eq!(gpu_state.direction, cpu_state.direction, "tick {tick} instance {id}");
            assert_eq!(gpu_state.previous_animation, cpu_state.previous_animation, "tick {tick} instance {id}");
            assert!(
                (gpu_state.progress - cpu_state.progress).abs() < 1e-5,
                "tick {tick} instance {id}: {} vs {}",
                gpu_state.progress,
                cpu_state.progress
            );
        }
    }
    assert_eq!(gpu.runner().ticks(), 9);
}

#[test]
fn oversized_grid_degrades_without_panicking() {
    let Some(context) = headless() else {
        return;
    };
    let side = context.max_texture_side();
    if side >= 1 << 16 {
        return;
    }
    let too_many = side.saturating_mul(side).saturating_add(1);
    let mut runner = GpuAnimationRunner::new(&context, too_many);
    assert!(runner.is_degraded());
    runner.compute(instanced_sprites::RunnerUniforms::new(10.0, 0.1));
    assert_eq!(runner.ticks(), 0);
    assert!(runner.read_back_states().is_err());
}

#[test]
fn sprite_pass_renders_patched_unlit_shader() {
    let Some(context) = headless() else {
        return;
    };
    let format = wgpu::TextureFormat::Rgba8UnormSrgb;
    for geometry in [SpriteGeometryKind::Quad, SpriteGeometryKind::Tri] {
        let runner = GpuAnimationRunner::new(&context, 4);
        if runner.is_degraded() {
            return;
        }
        let mut sprites = InstancedSpriteMesh::new(runner, config());
        sprites.set_spritesheet(sheet()).expect("spritesheet");
        sprites.play("run", true, PlayMode::Forward).all();
        sprites.set_flip_x_at(1, true);
        sprites.set_billboarding_global(true);
        sprites.set_tint_at(2, Some(TintHsv::new(1.0, 1.0, 1.0)));
        for id in 0..4 {
            sprites.set_matrix_at(id, Mat4::from_translation(Vec3::new(id as f32 * 0.4 - 0.6, 0.0, 0.0)));
        }
        sprites.update_with_delta(0.1);

        let pass_config = SpriteMeshConfig { geometry, ..config() };
        let mut pass = SpritePass::new(&context, format, &SurfaceShader::sprite_unlit(), &pass_config)
            .expect("sprite pipeline");
        assert_eq!(
            pass.patched_shader().source.contains("const SPRITE_TRI_GEOMETRY: bool = true;"),
            geometry == SpriteGeometryKind::Tri
        );
        assert!(pass.patched_shader().vertex_hooked);
        let _atlas = pass.upload_atlas(&image::RgbaImage::from_pixel(256, 32, image::Rgba([255, 0, 0, 255])));
        pass.write_camera(Mat4::IDENTITY, Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, -1.0, 1.0));
        pass.prepare(&mut sprites).expect("prepare sprites");
        assert!(!sprites.take_render_dirty().any());

        let target = context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Sprite Test Target"),
            size: wgpu::Extent3d { width: 64, height: 64, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = target.create_view(&wgpu::TextureViewDescriptor::default());
        context.device.push_error_scope(wgpu::ErrorFilter::Validation);
        pass.render(&view, wgpu::Color::TRANSPARENT).expect("render sprites");
        let error = pollster::block_on(context.device.pop_error_scope());
        assert!(error.is_none(), "{geometry:?} render raised {error:?}");
    }
}

const TARGET_WIDTH: u32 = 64;
const TARGET_HEIGHT: u32 = 32;
const BLUE: [u8; 4] = [0, 0, 255, 255];
const WHITE: [u8; 4] = [255, 255, 255, 255];

// Frame 0 is red|green, frame 1 is blue|white, each half 16 texels wide.
fn striped_atlas() -> image::RgbaImage {
    image::RgbaImage::from_fn(64, 16, |x, _| match x / 16 {
        0 => image::Rgba([255, 0, 0, 255]),
        1 => image::Rgba([0, 255, 0, 255]),
        2 => image::Rgba(BLUE),
        _ => image::Rgba(WHITE),
    })
}

fn striped_sheet() -> SpritesheetFormat {
    let frames = vec![FrameRect::new(0.0, 0.0, 0.5, 1.0), FrameRect::new(0.5, 0.0, 0.5, 1.0)];
    let mut sheet = SpritesheetFormat::new(frames, [64, 16]);
    sheet.push_animation("second", vec![AnimationFrame::new(1, 1.0)]);
    sheet
}

struct PixelTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl PixelTarget {
    fn new(context: &GpuContext) -> Self {
        let texture = context.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Sprite Readback Target"),
            size: wgpu::Extent3d { width: TARGET_WIDTH, height: TARGET_HEIGHT, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }

    fn read(&self, context: &GpuContext) -> Vec<[u8; 4]> {
        let unpadded = TARGET_WIDTH * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;
        let staging = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Pixel Readback"),
            size: u64::from(padded) * u64::from(TARGET_HEIGHT),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Sprite Pixel Copy") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(TARGET_HEIGHT),
                },
            },
            wgpu::Extent3d { width: TARGET_WIDTH, height: TARGET_HEIGHT, depth_or_array_layers: 1 },
        );
        context.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        context.device.poll(wgpu::PollType::wait_indefinitely()).expect("poll device");
        rx.recv().expect("map callback").expect("map readback buffer");
        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((TARGET_WIDTH * TARGET_HEIGHT) as usize);
        for row in 0..TARGET_HEIGHT as usize {
            let start = row * padded as usize;
            let texels: &[[u8; 4]] = bytemuck::cast_slice(&mapped[start..start + unpadded as usize]);
            pixels.extend_from_slice(texels);
        }
        pixels
    }
}

fn pixel(pixels: &[[u8; 4]], x: u32, y: u32) -> [u8; 4] {
    pixels[(y * TARGET_WIDTH + x) as usize]
}

fn striped_sprites(context: &GpuContext, count: u32) -> Option<InstancedSpriteMesh<GpuAnimationRunner>> {
    let runner = GpuAnimationRunner::new(context, count);
    if runner.is_degraded() {
        return None;
    }
    let mut sprites = InstancedSpriteMesh::new(runner, config());
    sprites.set_spritesheet(striped_sheet()).expect("spritesheet");
    sprites.play("second", true, PlayMode::Forward).all();
    Some(sprites)
}

fn readback_pass(context: &GpuContext, config: &SpriteMeshConfig) -> (SpritePass, wgpu::Texture) {
    let mut pass = SpritePass::new(context, wgpu::TextureFormat::Rgba8Unorm, &SurfaceShader::sprite_unlit(), config)
        .expect("sprite pipeline");
    let atlas = pass.upload_atlas(&striped_atlas());
    (pass, atlas)
}

fn draw(
    context: &GpuContext,
    pass: &mut SpritePass,
    sprites: &mut InstancedSpriteMesh<GpuAnimationRunner>,
) -> Vec<[u8; 4]> {
    let target = PixelTarget::new(context);
    pass.prepare(sprites).expect("prepare sprites");
    pass.render(&target.view, wgpu::Color::TRANSPARENT).expect("render sprites");
    target.read(context)
}

#[test]
fn quad_pixels_follow_frame_rect_flip_and_tint() {
    let Some(context) = headless() else {
        return;
    };
    let Some(mut sprites) = striped_sprites(&context, 2) else {
        return;
    };
    // Instance 0 fills the left half of the target, instance 1 the right half.
    let tall = Mat4::from_scale(Vec3::new(1.0, 2.0, 1.0));
    sprites.set_matrix_at(0, Mat4::from_translation(Vec3::new(-0.5, 0.0, 0.0)) * tall);
    sprites.set_matrix_at(1, Mat4::from_translation(Vec3::new(0.5, 0.0, 0.0)) * tall);
    sprites.set_flip_x_at(1, true);
    sprites.update_with_delta(0.01);

    let (mut pass, _atlas) = readback_pass(&context, &config());

    let pixels = draw(&context, &mut pass, &mut sprites);
    let row = TARGET_HEIGHT / 2;
    assert_eq!(pixel(&pixels, 8, row), BLUE, "left half of frame 1");
    assert_eq!(pixel(&pixels, 24, row), WHITE, "right half of frame 1");
    assert_eq!(pixel(&pixels, 40, row), WHITE, "flipped instance starts with the right half");
    assert_eq!(pixel(&pixels, 56, row), BLUE);

    // Global flip reaches instance 0; instance 1 keeps its own override.
    sprites.set_flip_x_global(true);
    let pixels = draw(&context, &mut pass, &mut sprites);
    assert_eq!(pixel(&pixels, 8, row), WHITE);
    assert_eq!(pixel(&pixels, 24, row), BLUE);
    assert_eq!(pixel(&pixels, 40, row), WHITE);

    sprites.set_flip_x_global(false);
    sprites.set_tint_at(0, Some(TintHsv::new(0.0, 1.0, 0.5)));
    let pixels = draw(&context, &mut pass, &mut sprites);
    let dimmed = pixel(&pixels, 24, row);
    for channel in &dimmed[..3] {
        assert!((126..=129).contains(channel), "tinted white came out {dimmed:?}");
    }
    assert_eq!(pixel(&pixels, 56, row), BLUE, "untinted instance is unchanged");
}

#[test]
fn triangle_pixels_show_zoomed_frame_and_discard_outside() {
    let Some(context) = headless() else {
        return;
    };
    let Some(mut sprites) = striped_sprites(&context, 1) else {
        return;
    };
    // The kept rectangle of the triangle lands on NDC x [-0.5, 0.5], y [-1, 1].
    let tall = Mat4::from_scale(Vec3::new(1.0, 2.0, 1.0));
    sprites.set_matrix_at(0, Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)) * tall);
    sprites.update_with_delta(0.01);

    let tri = SpriteMeshConfig { geometry: SpriteGeometryKind::Tri, ..config() };
    let (mut pass, _atlas) = readback_pass(&context, &tri);

    let pixels = draw(&context, &mut pass, &mut sprites);
    let row = TARGET_HEIGHT / 2;
    assert_eq!(pixel(&pixels, 24, row), BLUE);
    assert_eq!(pixel(&pixels, 40, row), WHITE);
    assert_eq!(pixel(&pixels, 4, row)[3], 0, "outside the kept rectangle stays clear");
    assert_eq!(pixel(&pixels, 60, row)[3], 0);
}

#[test]
fn sprite_bind_groups_are_reused_across_ticks() {
    let Some(context) = headless() else {
        return;
    };
    let Some(mut sprites) = striped_sprites(&context, 2) else {
        return;
    };
    let (mut pass, _atlas) = readback_pass(&context, &config());
    let target = PixelTarget::new(&context);
    for _ in 0..6 {
        sprites.update_with_delta(0.05);
        pass.prepare(&mut sprites).expect("prepare sprites");
        pass.render(&target.view, wgpu::Color::TRANSPARENT).expect("render sprites");
    }
    assert_eq!(pass.bind_group_builds(), 2, "one bind group per state texture");

    sprites.set_spritesheet(striped_sheet()).expect("rebind spritesheet");
    sprites.update_with_delta(0.05);
    pass.prepare(&mut sprites).expect("prepare sprites");
    assert_eq!(pass.bind_group_builds(), 3, "a new spritesheet rebuilds the bind group");
}
