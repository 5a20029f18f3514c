//! Per-instance playback state machine.
//!
//! [`advance`] is the reference implementation of one tick for one instance. The WGSL
//! kernel in `assets/shaders/animation_runner.wgsl` runs the same steps on the GPU, one
//! invocation per grid cell, and [`CpuAnimationRunner`] runs them over a flat arena for
//! headless hosts.

use crate::encoder::EncodedSpritesheet;
use crate::instructions::{InstructionBuffer, PlayMode, MANUAL_FRAME_BIAS, NO_LOOP_FLAG};
use std::ops::Range;
use std::sync::Arc;

const DIRECTION_ASCENDING: f32 = 0.0;
const DIRECTION_DESCENDING: f32 = 1.0;

/// Output of the kernel for one instance, laid out as one RGBA32F texel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PlaybackState {
    /// Global spritesheet frame to display.
    pub frame: f32,
    /// Phase within the current animation cycle.
    pub progress: f32,
    /// Ping-pong leg: 0 ascending, 1 descending.
    pub direction: f32,
    /// Animation channel seen on the previous tick.
    pub previous_animation: f32,
}

impl PlaybackState {
    pub fn from_array(raw: [f32; 4]) -> Self {
        Self { frame: raw[0], progress: raw[1], direction: raw[2], previous_animation: raw[3] }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.frame, self.progress, self.direction, self.previous_animation]
    }

    pub fn frame_index(&self) -> u32 {
        self.frame.max(0.0) as u32
    }
}

/// Values shared by every instance during one tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RunnerUniforms {
    pub fps: f32,
    pub delta_time: f32,
}

impl RunnerUniforms {
    pub const fn new(fps: f32, delta_time: f32) -> Self {
        Self { fps, delta_time }
    }
}

/// Square grid mapping instance ids onto texture cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationGrid {
    side: u32,
    count: u32,
}

impl AnimationGrid {
    /// Side is the smallest power of two whose square holds `count` cells.
    pub fn for_instances(count: u32) -> Self {
        let mut root = (count as f64).sqrt().ceil() as u32;
        while (root as u64) * (root as u64) < count as u64 {
            root += 1;
        }
        Self { side: root.max(1).next_power_of_two(), count }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn instance_count(&self) -> u32 {
        self.count
    }

    pub fn capacity(&self) -> u32 {
        self.side * self.side
    }

    pub fn cell_of(&self, instance: u32) -> (u32, u32) {
        (instance % self.side, instance / self.side)
    }

    /// Grid rows touched by the instance range `[start, end)`.
    pub fn rows_for(&self, range: &Range<usize>) -> Range<u32> {
        if range.is_empty() {
            return 0..0;
        }
        let first = range.start as u32 / self.side;
        let last = (range.end as u32 - 1) / self.side;
        first..(last + 1).min(self.side)
    }

    pub fn workgroups(&self, workgroup_size: u32) -> u32 {
        self.side.div_ceil(workgroup_size)
    }
}

/// Floor-based modulo into `[0, 1)`.
pub fn wrap_unit(value: f32) -> f32 {
    let wrapped = value - value.floor();
    if wrapped >= 1.0 {
        0.0
    } else {
        wrapped
    }
}

fn triangle_wave(value: f32) -> f32 {
    let t = wrap_unit(value * 0.5) * 2.0;
    if t > 1.0 {
        2.0 - t
    } else {
        t
    }
}

/// Ping-pong runs on an unfolded phase in `[0, 2)`: the first half ascends, the second
/// descends. Folding it back keeps stored progress in `[0, 1]` for any step size.
fn ping_pong(progress: f32, direction: f32, step: f32, looped: bool) -> (f32, f32) {
    let unfolded = if direction < 0.5 { progress } else { 2.0 - progress };
    let mut next = unfolded + step;
    if looped {
        next = wrap_unit(next * 0.5) * 2.0;
    } else {
        next = next.min(2.0);
    }
    if next >= 1.0 {
        (2.0 - next, DIRECTION_DESCENDING)
    } else {
        (next, DIRECTION_ASCENDING)
    }
}

/// One tick of the playback state machine for a single instance.
pub fn advance(
    prev: PlaybackState,
    instruction: [f32; 4],
    table: &EncodedSpritesheet,
    uniforms: RunnerUniforms,
) -> PlaybackState {
    let [animation_channel, offset, mode_channel, manual_frame] = instruction;

    if manual_frame >= MANUAL_FRAME_BIAS {
        return PlaybackState {
            frame: manual_frame - MANUAL_FRAME_BIAS,
            progress: prev.progress,
            direction: prev.direction,
            previous_animation: animation_channel,
        };
    }

    let animation = animation_channel.round().max(0.0) as u32;
    let length = table.animation_length(animation) as f32;
    let total_time = if uniforms.fps > 0.0 { length / uniforms.fps } else { 0.0 };
    let step = if total_time > 0.0 { uniforms.delta_time / total_time } else { 0.0 };
    let looped = mode_channel < NO_LOOP_FLAG;
    let mode_code = (mode_channel - (mode_channel / NO_LOOP_FLAG).floor() * NO_LOOP_FLAG) as u32;
    let mode = PlayMode::from_code(mode_code).unwrap_or(PlayMode::Forward);

    let mut progress = prev.progress;
    let mut direction = DIRECTION_ASCENDING;
    match mode {
        PlayMode::Forward => progress += step,
        PlayMode::Reverse => progress -= step,
        PlayMode::Pause => direction = prev.direction,
        PlayMode::PingPong => (progress, direction) = ping_pong(progress, prev.direction, step, looped),
    }
    if looped && mode != PlayMode::PingPong {
        progress = wrap_unit(progress);
    }

    if prev.previous_animation != animation_channel {
        progress = 0.0;
        direction = DIRECTION_ASCENDING;
    }

    let phase = if total_time > 0.0 { offset / total_time } else { 0.0 };
    let sample = match (mode, looped) {
        (PlayMode::PingPong, true) => triangle_wave(progress + phase),
        (_, true) => wrap_unit(progress + phase),
        (_, false) => progress + phase,
    };
    let last_column = (length - 1.0).max(0.0);
    let column = (length * sample).floor().clamp(0.0, last_column) as u32;
    let frame = table.animation_frame(animation, column);

    PlaybackState { frame: frame as f32, progress, direction, previous_animation: animation_channel }
}

/// Backend that evaluates the playback state machine once per tick.
pub trait PlaybackRunner {
    fn grid(&self) -> AnimationGrid;

    /// Swaps in a new encoded spritesheet; the previous table is dropped, never mutated.
    fn set_spritesheet(&mut self, table: Arc<EncodedSpritesheet>);

    /// Makes instruction records in `range` visible to the next [`PlaybackRunner::compute`].
    fn upload_instructions(&mut self, instructions: &InstructionBuffer, range: Range<usize>);

    fn compute(&mut self, uniforms: RunnerUniforms);

    /// CPU-visible state of one instance, when the backend keeps one.
    fn state(&self, instance: usize) -> Option<PlaybackState>;

    fn is_degraded(&self) -> bool {
        false
    }
}

/// Double-buffered arena implementation of the kernel.
pub struct CpuAnimationRunner {
    grid: AnimationGrid,
    table: Option<Arc<EncodedSpritesheet>>,
    instructions: Vec<[f32; 4]>,
    states: [Vec<PlaybackState>; 2],
    current: usize,
    ticks: u64,
}

impl CpuAnimationRunner {
    pub fn new(instance_count: u32) -> Self {
        let count = instance_count as usize;
        Self {
            grid: AnimationGrid::for_instances(instance_count),
            table: None,
            instructions: vec![[0.0; 4]; count],
            states: [vec![PlaybackState::default(); count], vec![PlaybackState::default(); count]],
            current: 0,
            ticks: 0,
        }
    }

    pub fn states(&self) -> &[PlaybackState] {
        &self.states[self.current]
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl PlaybackRunner for CpuAnimationRunner {
    fn grid(&self) -> AnimationGrid {
        self.grid
    }

    fn set_spritesheet(&mut self, table: Arc<EncodedSpritesheet>) {
        self.table = Some(table);
    }

    fn upload_instructions(&mut self, instructions: &InstructionBuffer, range: Range<usize>) {
        let end = range.end.min(self.instructions.len()).min(instructions.len());
        let start = range.start.min(end);
        self.instructions[start..end].copy_from_slice(&instructions.as_slice()[start..end]);
    }

    fn compute(&mut self, uniforms: RunnerUniforms) {
        let Some(table) = self.table.as_deref() else {
            log::debug!("[runner] no spritesheet bound, skipping tick");
            return;
        };
        let (front, back) = self.states.split_at_mut(1);
        let (read, write) = if self.current == 0 { (&front[0], &mut back[0]) } else { (&back[0], &mut front[0]) };
        for ((out, prev), instruction) in write.iter_mut().zip(read.iter()).zip(self.instructions.iter()) {
            *out = advance(*prev, *instruction, table, uniforms);
        }
        self.current = 1 - self.current;
        self.ticks += 1;
    }

    fn state(&self, instance: usize) -> Option<PlaybackState> {
        self.states[self.current].get(instance).copied()
    }
}
