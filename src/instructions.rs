//! Per-instance playback instructions and the CPU-side buffer that holds them.
//!
//! Each instance owns one RGBA32F record:
//! * `r`: animation id
//! * `g`: time offset in seconds
//! * `b`: play mode code, plus [`NO_LOOP_FLAG`] when the animation plays once
//! * `a`: manual frame plus [`MANUAL_FRAME_BIAS`]; anything below the bias means "no override"

use std::ops::Range;

pub const NO_LOOP_FLAG: f32 = 10.0;
pub const MANUAL_FRAME_BIAS: f32 = 10.0;
/// Value written to the manual-frame channel to release a pinned frame.
pub const MANUAL_FRAME_UNSET: f32 = 0.0;

const CH_ANIMATION: usize = 0;
const CH_OFFSET: usize = 1;
const CH_MODE: usize = 2;
const CH_MANUAL_FRAME: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum PlayMode {
    #[default]
    Forward,
    Reverse,
    Pause,
    PingPong,
}

impl PlayMode {
    pub const fn code(self) -> u32 {
        match self {
            PlayMode::Forward => 0,
            PlayMode::Reverse => 1,
            PlayMode::Pause => 2,
            PlayMode::PingPong => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PlayMode::Forward),
            1 => Some(PlayMode::Reverse),
            2 => Some(PlayMode::Pause),
            3 => Some(PlayMode::PingPong),
            _ => None,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "forward" => Some(PlayMode::Forward),
            "reverse" => Some(PlayMode::Reverse),
            "pause" | "paused" => Some(PlayMode::Pause),
            "pingpong" | "ping_pong" => Some(PlayMode::PingPong),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlayMode::Forward => "forward",
            PlayMode::Reverse => "reverse",
            PlayMode::Pause => "pause",
            PlayMode::PingPong => "pingpong",
        }
    }

    /// Channel value for this mode combined with the loop flag.
    pub fn encode(self, looped: bool) -> f32 {
        self.code() as f32 + if looped { 0.0 } else { NO_LOOP_FLAG }
    }
}

/// Typed view of one instruction record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub animation: u32,
    pub offset: f32,
    pub mode: PlayMode,
    pub looped: bool,
    pub manual_frame: Option<u32>,
}

impl Default for Instruction {
    fn default() -> Self {
        Self { animation: 0, offset: 0.0, mode: PlayMode::Forward, looped: true, manual_frame: None }
    }
}

impl Instruction {
    pub fn encode(&self) -> [f32; 4] {
        [
            self.animation as f32,
            self.offset,
            self.mode.encode(self.looped),
            self.manual_frame.map_or(MANUAL_FRAME_UNSET, |frame| frame as f32 + MANUAL_FRAME_BIAS),
        ]
    }

    /// Unknown mode codes decode as [`PlayMode::Forward`], matching the kernel.
    pub fn decode(raw: [f32; 4]) -> Self {
        let mode_code = raw[CH_MODE].max(0.0).rem_euclid(NO_LOOP_FLAG).floor() as u32;
        Self {
            animation: raw[CH_ANIMATION].round().max(0.0) as u32,
            offset: raw[CH_OFFSET],
            mode: PlayMode::from_code(mode_code).unwrap_or_default(),
            looped: raw[CH_MODE] < NO_LOOP_FLAG,
            manual_frame: if raw[CH_MANUAL_FRAME] >= MANUAL_FRAME_BIAS {
                Some((raw[CH_MANUAL_FRAME] - MANUAL_FRAME_BIAS) as u32)
            } else {
                None
            },
        }
    }
}

/// CPU copy of every instance's instruction, uploaded to the GPU once per tick when dirty.
#[derive(Debug, Clone)]
pub struct InstructionBuffer {
    records: Vec<[f32; 4]>,
    dirty: Option<Range<usize>>,
}

impl InstructionBuffer {
    pub fn new(count: usize) -> Self {
        let initial = Instruction::default().encode();
        Self { records: vec![initial; count], dirty: (count > 0).then_some(0..count) }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn raw(&self, id: usize) -> Option<[f32; 4]> {
        self.records.get(id).copied()
    }

    pub fn get(&self, id: usize) -> Option<Instruction> {
        self.raw(id).map(Instruction::decode)
    }

    pub fn as_slice(&self) -> &[[f32; 4]] {
        &self.records
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.records)
    }

    pub fn set(&mut self, id: usize, instruction: Instruction) {
        let encoded = instruction.encode();
        if let Some(record) = self.record_mut(id) {
            *record = encoded;
        }
    }

    pub fn set_animation(&mut self, id: usize, animation: u32) {
        self.write(id, CH_ANIMATION, animation as f32);
    }

    pub fn set_offset(&mut self, id: usize, offset: f32) {
        self.write(id, CH_OFFSET, offset);
    }

    /// Changes the mode while keeping the current loop flag.
    pub fn set_playmode(&mut self, id: usize, mode: PlayMode) {
        if let Some(raw) = self.raw(id) {
            let looped = raw[CH_MODE] < NO_LOOP_FLAG;
            self.write(id, CH_MODE, mode.encode(looped));
        }
    }

    /// Writes the mode channel verbatim (mode code plus optional no-loop flag).
    pub fn set_raw_playmode(&mut self, id: usize, value: f32) {
        self.write(id, CH_MODE, value);
    }

    pub fn set_loop(&mut self, id: usize, looped: bool) {
        if let Some(raw) = self.raw(id) {
            let mode = raw[CH_MODE].max(0.0).rem_euclid(NO_LOOP_FLAG);
            self.write(id, CH_MODE, mode + if looped { 0.0 } else { NO_LOOP_FLAG });
        }
    }

    pub fn set_manual_frame(&mut self, id: usize, frame: Option<u32>) {
        let value = frame.map_or(MANUAL_FRAME_UNSET, |frame| frame as f32 + MANUAL_FRAME_BIAS);
        self.write(id, CH_MANUAL_FRAME, value);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn mark_all_dirty(&mut self) {
        if !self.records.is_empty() {
            self.dirty = Some(0..self.records.len());
        }
    }

    /// Returns the range of instances written since the last call and clears it.
    pub fn take_dirty(&mut self) -> Option<Range<usize>> {
        self.dirty.take()
    }

    fn write(&mut self, id: usize, channel: usize, value: f32) {
        if let Some(record) = self.record_mut(id) {
            record[channel] = value;
        }
    }

    fn record_mut(&mut self, id: usize) -> Option<&mut [f32; 4]> {
        let len = self.records.len();
        let Some(record) = self.records.get_mut(id) else {
            log::warn!("[instructions] instance {id} is out of range ({len} instances), write ignored");
            return None;
        };
        self.dirty = Some(match self.dirty.take() {
            Some(range) => range.start.min(id)..range.end.max(id + 1),
            None => id..id + 1,
        });
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_uses_boundary_offsets() {
        let instruction = Instruction {
            animation: 3,
            offset: 0.5,
            mode: PlayMode::Reverse,
            looped: false,
            manual_frame: Some(7),
        };
        assert_eq!(instruction.encode(), [3.0, 0.5, 11.0, 17.0]);
        assert_eq!(Instruction::decode(instruction.encode()), instruction);
        assert_eq!(Instruction::default().encode(), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn loop_toggle_keeps_mode() {
        let mut buffer = InstructionBuffer::new(2);
        buffer.set_playmode(1, PlayMode::Pause);
        buffer.set_loop(1, false);
        assert_eq!(buffer.raw(1).unwrap()[2], 12.0);
        buffer.set_playmode(1, PlayMode::Reverse);
        assert_eq!(buffer.raw(1).unwrap()[2], 11.0, "mode change keeps the no-loop flag");
        buffer.set_loop(1, true);
        let decoded = buffer.get(1).unwrap();
        assert_eq!(decoded.mode, PlayMode::Reverse);
        assert!(decoded.looped);
    }

    #[test]
    fn dirty_range_covers_all_writes() {
        let mut buffer = InstructionBuffer::new(10);
        assert_eq!(buffer.take_dirty(), Some(0..10), "fresh buffers need a full upload");
        assert!(!buffer.is_dirty());
        buffer.set_offset(6, 1.0);
        buffer.set_animation(2, 1);
        buffer.set_animation(4, 1);
        assert_eq!(buffer.take_dirty(), Some(2..7));
        assert_eq!(buffer.take_dirty(), None);
    }

    #[test]
    fn out_of_range_writes_are_ignored() {
        let mut buffer = InstructionBuffer::new(1);
        buffer.take_dirty();
        buffer.set_animation(5, 2);
        assert!(!buffer.is_dirty());
        assert_eq!(buffer.raw(5), None);
    }

    #[test]
    fn manual_frame_roundtrips_through_sentinel() {
        let mut buffer = InstructionBuffer::new(1);
        buffer.set_manual_frame(0, Some(0));
        assert_eq!(buffer.raw(0).unwrap()[3], 10.0);
        buffer.set_manual_frame(0, None);
        assert_eq!(buffer.get(0).unwrap().manual_frame, None);
    }

    #[test]
    fn last_write_wins_per_channel() {
        let mut buffer = InstructionBuffer::new(1);
        buffer.set_animation(0, 1);
        buffer.set_animation(0, 2);
        buffer.set_offset(0, 0.25);
        assert_eq!(buffer.raw(0).unwrap()[..2], [2.0, 0.25]);
    }

    #[test]
    fn play_mode_parses_names() {
        assert_eq!(PlayMode::from_str("FORWARD"), Some(PlayMode::Forward));
        assert_eq!(PlayMode::from_str("ping_pong"), Some(PlayMode::PingPong));
        assert_eq!(PlayMode::from_str("sideways"), None);
        assert_eq!(PlayMode::from_code(PlayMode::Pause.code()), Some(PlayMode::Pause));
    }
}
