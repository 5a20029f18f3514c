//! Per-instance control surface for a batch of animated sprites.
//!
//! Setters never fail: unknown animation names fall back to animation 0 and writes to
//! out-of-range instances are dropped with a warning. Instruction writes are coalesced
//! until the next [`InstancedSpriteMesh::update`], which uploads them and runs one tick.

use crate::config::{InstructionUploadPolicy, SpriteMeshConfig};
use crate::encoder::EncodedSpritesheet;
use crate::instructions::{InstructionBuffer, PlayMode};
use crate::playback::{CpuAnimationRunner, PlaybackRunner, PlaybackState, RunnerUniforms};
use crate::shader::{SpriteFlags, SpriteGlobalsUniform, SpriteInstanceRecord, TintHsv};
use crate::spritesheet::SpritesheetFormat;
use crate::time::Time;
use anyhow::Result;
use glam::Mat4;
use rand::Rng;
use std::sync::Arc;

/// Render-side data changed since the last [`InstancedSpriteMesh::take_render_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderDirty {
    pub params: bool,
    pub transforms: bool,
}

impl RenderDirty {
    pub fn any(&self) -> bool {
        self.params || self.transforms
    }
}

pub struct InstancedSpriteMesh<R: PlaybackRunner> {
    runner: R,
    config: SpriteMeshConfig,
    spritesheet: Option<SpritesheetFormat>,
    table: Option<Arc<EncodedSpritesheet>>,
    instructions: InstructionBuffer,
    params: Vec<SpriteInstanceRecord>,
    transforms: Vec<Mat4>,
    global_flip_x: bool,
    global_flip_y: bool,
    global_billboard: bool,
    global_tint: Option<TintHsv>,
    time: Time,
    fps: f32,
    dirty: RenderDirty,
}

impl InstancedSpriteMesh<CpuAnimationRunner> {
    /// Mesh driven by the CPU runner, for headless hosts and tooling.
    pub fn cpu(count: u32, config: SpriteMeshConfig) -> Self {
        Self::new(CpuAnimationRunner::new(count), config)
    }
}

impl<R: PlaybackRunner> InstancedSpriteMesh<R> {
    /// Instance count comes from the runner grid.
    pub fn new(runner: R, config: SpriteMeshConfig) -> Self {
        let count = runner.grid().instance_count() as usize;
        Self {
            runner,
            fps: config.fps,
            global_billboard: config.billboarding,
            config,
            spritesheet: None,
            table: None,
            instructions: InstructionBuffer::new(count),
            params: vec![SpriteInstanceRecord::default(); count],
            transforms: vec![Mat4::IDENTITY; count],
            global_flip_x: false,
            global_flip_y: false,
            global_tint: None,
            time: Time::new(),
            dirty: RenderDirty { params: true, transforms: true },
        }
    }

    pub fn count(&self) -> usize {
        self.instructions.len()
    }

    pub fn config(&self) -> &SpriteMeshConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    pub fn instructions(&self) -> &InstructionBuffer {
        &self.instructions
    }

    pub fn time(&self) -> &Time {
        &self.time
    }

    /// Encodes `sheet` and swaps it in for the runner and the renderer.
    pub fn set_spritesheet(&mut self, sheet: SpritesheetFormat) -> Result<()> {
        sheet.ensure_valid()?;
        let table = Arc::new(EncodedSpritesheet::encode(&sheet)?);
        self.runner.set_spritesheet(Arc::clone(&table));
        log::debug!(
            "[sprites] spritesheet bound: {} frames, {} animations ({}x{} table)",
            sheet.frame_count(),
            table.animation_count(),
            table.width(),
            table.height()
        );
        self.table = Some(table);
        self.spritesheet = Some(sheet);
        Ok(())
    }

    pub fn spritesheet(&self) -> Option<&SpritesheetFormat> {
        self.spritesheet.as_ref()
    }

    pub fn encoded_spritesheet(&self) -> Option<&Arc<EncodedSpritesheet>> {
        self.table.as_ref()
    }

    pub fn animation_index(&self, name: &str) -> Option<u32> {
        self.table.as_deref().and_then(|table| table.animation_index(name))
    }

    fn resolve_animation(&self, name: &str) -> u32 {
        self.animation_index(name).unwrap_or_else(|| {
            log::warn!("[sprites] unknown animation '{name}', falling back to animation 0");
            0
        })
    }

    pub fn set_animation_at(&mut self, id: usize, name: &str) {
        let animation = self.resolve_animation(name);
        self.instructions.set_animation(id, animation);
    }

    /// `mesh.play("run", true, PlayMode::Forward).at(3)`
    pub fn play(&mut self, name: &str, looped: bool, mode: PlayMode) -> PlayCommand<'_, R> {
        let animation = self.resolve_animation(name);
        PlayCommand { mesh: self, animation, looped, mode }
    }

    pub fn set_playmode_at(&mut self, id: usize, mode: PlayMode) {
        self.instructions.set_playmode(id, mode);
    }

    /// Keeps each instance's loop flag.
    pub fn set_playmode_all(&mut self, mode: PlayMode) {
        for id in 0..self.count() {
            self.instructions.set_playmode(id, mode);
        }
    }

    /// Pins instance `id` to global spritesheet frame `frame`.
    pub fn set_frame_at(&mut self, id: usize, frame: u32) {
        self.instructions.set_manual_frame(id, Some(frame));
    }

    /// Pins instance `id` to the `local`-th step of animation `name`.
    pub fn set_animation_frame_at(&mut self, id: usize, name: &str, local: usize) {
        let global = self.spritesheet.as_ref().and_then(|sheet| sheet.global_frame(name, local));
        let frame = global.unwrap_or_else(|| {
            log::warn!("[sprites] animation '{name}' has no step {local}, pinning frame {local}");
            local as u32
        });
        self.set_frame_at(id, frame);
    }

    pub fn unset_frame_at(&mut self, id: usize) {
        self.instructions.set_manual_frame(id, None);
    }

    pub fn unset_frame_all(&mut self) {
        for id in 0..self.count() {
            self.instructions.set_manual_frame(id, None);
        }
    }

    pub fn set_offset_at(&mut self, id: usize, seconds: f32) {
        self.instructions.set_offset(id, seconds);
    }

    /// Offsets every instance by a uniform random amount in `[0, scale)` seconds.
    pub fn randomize_offsets(&mut self, scale: f32) {
        let mut rng = rand::thread_rng();
        self.randomize_offsets_with(&mut rng, scale);
    }

    pub fn randomize_offsets_with<G: Rng + ?Sized>(&mut self, rng: &mut G, scale: f32) {
        for id in 0..self.count() {
            let offset = rng.gen::<f32>() * scale;
            self.instructions.set_offset(id, offset);
        }
    }

    pub fn set_loop_at(&mut self, id: usize, looped: bool) {
        self.instructions.set_loop(id, looped);
    }

    pub fn set_loop_all(&mut self, looped: bool) {
        for id in 0..self.count() {
            self.instructions.set_loop(id, looped);
        }
    }

    pub fn set_flip_x_at(&mut self, id: usize, flip: bool) {
        self.set_override(id, SpriteFlags::FLIP_X, flip);
    }

    pub fn set_flip_x_global(&mut self, flip: bool) {
        self.global_flip_x = flip;
        self.dirty.params = true;
    }

    pub fn unset_flip_x_all(&mut self) {
        self.clear_override(SpriteFlags::FLIP_X);
    }

    pub fn set_flip_y_at(&mut self, id: usize, flip: bool) {
        self.set_override(id, SpriteFlags::FLIP_Y, flip);
    }

    pub fn set_flip_y_global(&mut self, flip: bool) {
        self.global_flip_y = flip;
        self.dirty.params = true;
    }

    pub fn unset_flip_y_all(&mut self) {
        self.clear_override(SpriteFlags::FLIP_Y);
    }

    pub fn set_billboarding_at(&mut self, id: usize, enabled: bool) {
        self.set_override(id, SpriteFlags::BILLBOARD, enabled);
    }

    pub fn set_billboarding_global(&mut self, enabled: bool) {
        self.global_billboard = enabled;
        self.dirty.params = true;
    }

    pub fn unset_billboarding_all(&mut self) {
        self.clear_override(SpriteFlags::BILLBOARD);
    }

    /// `None` disables the global tint.
    pub fn set_tint_global(&mut self, tint: Option<TintHsv>) {
        self.global_tint = tint;
        self.dirty.params = true;
    }

    /// Overrides the global tint for one instance; `None` forces no tint.
    pub fn set_tint_at(&mut self, id: usize, tint: Option<TintHsv>) {
        let Some(record) = self.record_mut(id) else {
            return;
        };
        record.tint = TintHsv::to_uniform(tint);
        record.overrides |= SpriteFlags::TINT.bits();
        self.dirty.params = true;
    }

    pub fn unset_tint_all(&mut self) {
        for record in &mut self.params {
            record.tint = [0.0; 4];
        }
        self.clear_override(SpriteFlags::TINT);
    }

    pub fn set_matrix_at(&mut self, id: usize, matrix: Mat4) {
        match self.transforms.get_mut(id) {
            Some(slot) => {
                *slot = matrix;
                self.dirty.transforms = true;
            }
            None => log::warn!("[sprites] instance {id} is out of range, transform ignored"),
        }
    }

    pub fn matrix_at(&self, id: usize) -> Option<Mat4> {
        self.transforms.get(id).copied()
    }

    pub fn transforms(&self) -> &[Mat4] {
        &self.transforms
    }

    pub fn instance_records(&self) -> &[SpriteInstanceRecord] {
        &self.params
    }

    /// Effective per-instance flags after resolving overrides against the globals.
    pub fn flags_at(&self, id: usize) -> Option<SpriteFlags> {
        let record = self.params.get(id)?;
        let overrides = SpriteFlags::from_bits_truncate(record.overrides);
        let local = SpriteFlags::from_bits_truncate(record.flags);
        let mut flags = SpriteFlags::empty();
        for (flag, global) in [
            (SpriteFlags::FLIP_X, self.global_flip_x),
            (SpriteFlags::FLIP_Y, self.global_flip_y),
            (SpriteFlags::BILLBOARD, self.global_billboard),
        ] {
            let on = if overrides.contains(flag) { local.contains(flag) } else { global };
            flags.set(flag, on);
        }
        let tint_on = if overrides.contains(SpriteFlags::TINT) { record.tint[3] > 0.5 } else { self.global_tint.is_some() };
        flags.set(SpriteFlags::TINT, tint_on);
        Some(flags)
    }

    pub fn globals_uniform(&self) -> SpriteGlobalsUniform {
        SpriteGlobalsUniform {
            tint: TintHsv::to_uniform(self.global_tint),
            grid_side: self.runner.grid().side(),
            flip_x: u32::from(self.global_flip_x),
            flip_y: u32::from(self.global_flip_y),
            billboard: u32::from(self.global_billboard),
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn set_fps(&mut self, fps: f32) {
        self.fps = fps.max(0.0);
    }

    pub fn state_at(&self, id: usize) -> Option<PlaybackState> {
        self.runner.state(id)
    }

    /// Advances by the wall-clock delta since the previous update, clamped to `max_delta`.
    pub fn update(&mut self) {
        self.time.tick();
        let delta = self.time.delta_seconds().min(self.config.max_delta.max(0.0));
        self.tick(delta);
    }

    /// Advances by exactly `delta_seconds`.
    pub fn update_with_delta(&mut self, delta_seconds: f32) {
        self.time.advance(delta_seconds);
        let delta = if delta_seconds.is_finite() { delta_seconds.max(0.0) } else { 0.0 };
        self.tick(delta);
    }

    /// Returns and clears the render-side dirty flags.
    pub fn take_render_dirty(&mut self) -> RenderDirty {
        std::mem::take(&mut self.dirty)
    }

    fn tick(&mut self, delta: f32) {
        if let Some(range) = self.instructions.take_dirty() {
            let range = match self.config.instance_upload {
                InstructionUploadPolicy::Full => 0..self.instructions.len(),
                InstructionUploadPolicy::DirtyRows => range,
            };
            self.runner.upload_instructions(&self.instructions, range);
        }
        self.runner.compute(RunnerUniforms::new(self.fps, delta));
    }

    fn record_mut(&mut self, id: usize) -> Option<&mut SpriteInstanceRecord> {
        let count = self.params.len();
        let record = self.params.get_mut(id);
        if record.is_none() {
            log::warn!("[sprites] instance {id} is out of range ({count} instances), write ignored");
        }
        record
    }

    fn set_override(&mut self, id: usize, flag: SpriteFlags, on: bool) {
        let Some(record) = self.record_mut(id) else {
            return;
        };
        let mut flags = SpriteFlags::from_bits_truncate(record.flags);
        flags.set(flag, on);
        record.flags = flags.bits();
        record.overrides |= flag.bits();
        self.dirty.params = true;
    }

    fn clear_override(&mut self, flag: SpriteFlags) {
        for record in &mut self.params {
            record.overrides &= !flag.bits();
            record.flags &= !flag.bits();
        }
        self.dirty.params = true;
    }
}

/// Pending `play` call; applied with [`PlayCommand::at`] or [`PlayCommand::all`].
pub struct PlayCommand<'a, R: PlaybackRunner> {
    mesh: &'a mut InstancedSpriteMesh<R>,
    animation: u32,
    looped: bool,
    mode: PlayMode,
}

impl<R: PlaybackRunner> PlayCommand<'_, R> {
    pub fn at(mut self, id: usize) {
        self.apply(id);
    }

    pub fn all(mut self) {
        for id in 0..self.mesh.count() {
            self.apply(id);
        }
    }

    fn apply(&mut self, id: usize) {
        let instructions = &mut self.mesh.instructions;
        instructions.set_animation(id, self.animation);
        instructions.set_raw_playmode(id, self.mode.encode(self.looped));
    }
}
