//! Logical spritesheet description shared by the asset importers and the encoder.
//!
//! A spritesheet is a table of normalized frame rectangles plus an ordered list of
//! named animations. Each animation is a sequence of `(global frame, duration)` pairs.
//! Animation order matters: the encoder assigns animation ids in this order, so it is
//! preserved through JSON round-trips.

use anyhow::{anyhow, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;

pub mod aseprite;
pub mod builder;

pub use builder::{AnimationMeta, FrameRange, Slicing, SpritesheetBuilder};

/// Frame rectangle in normalized atlas coordinates, origin at the image top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct FrameRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl FrameRect {
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.w, self.h]
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }
}

impl From<[f32; 4]> for FrameRect {
    fn from(value: [f32; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<FrameRect> for [f32; 4] {
    fn from(rect: FrameRect) -> Self {
        rect.to_array()
    }
}

/// One step of an animation: which global frame to show and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(u32, f32)", into = "(u32, f32)")]
pub struct AnimationFrame {
    pub frame: u32,
    pub duration: f32,
}

impl AnimationFrame {
    pub const fn new(frame: u32, duration: f32) -> Self {
        Self { frame, duration }
    }
}

impl From<(u32, f32)> for AnimationFrame {
    fn from((frame, duration): (u32, f32)) -> Self {
        Self { frame, duration }
    }
}

impl From<AnimationFrame> for (u32, f32) {
    fn from(frame: AnimationFrame) -> Self {
        (frame.frame, frame.duration)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpriteAnimation {
    pub name: String,
    pub frames: Vec<AnimationFrame>,
}

impl SpriteAnimation {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// The boundary structure between asset producers and the encoder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpritesheetFormat {
    pub frames: Vec<FrameRect>,
    #[serde(with = "ordered_animations")]
    pub animations: Vec<SpriteAnimation>,
    #[serde(default)]
    pub sheet_size: [u32; 2],
    #[serde(default)]
    pub animation_lengths: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueSeverity {
    Warning,
    Error,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueSeverity::Warning => write!(f, "warning"),
            IssueSeverity::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpritesheetIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

impl SpritesheetIssue {
    fn error(message: impl Into<String>) -> Self {
        Self { severity: IssueSeverity::Error, message: message.into() }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self { severity: IssueSeverity::Warning, message: message.into() }
    }
}

impl SpritesheetFormat {
    pub fn new(frames: Vec<FrameRect>, sheet_size: [u32; 2]) -> Self {
        Self { frames, animations: Vec::new(), sheet_size, animation_lengths: Vec::new() }
    }

    /// Appends an animation (or replaces one with the same name, keeping its position).
    ///
    /// `animation_lengths` is rebuilt from the animations afterwards.
    pub fn push_animation(&mut self, name: impl Into<String>, frames: Vec<AnimationFrame>) {
        let name = name.into();
        match self.animation_index(&name) {
            Some(index) => self.animations[index].frames = frames,
            None => self.animations.push(SpriteAnimation { name, frames }),
        }
        self.animation_lengths = self.animations.iter().map(|anim| anim.len() as u32).collect();
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read spritesheet {}", path.display()))?;
        Self::from_json_slice(&bytes).with_context(|| format!("Failed to parse spritesheet {}", path.display()))
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn animation_count(&self) -> usize {
        self.animations.len()
    }

    pub fn animation_index(&self, name: &str) -> Option<usize> {
        self.animations.iter().position(|anim| anim.name == name)
    }

    pub fn animation(&self, name: &str) -> Option<&SpriteAnimation> {
        self.animations.iter().find(|anim| anim.name == name)
    }

    pub fn animation_names(&self) -> impl Iterator<Item = &str> {
        self.animations.iter().map(|anim| anim.name.as_str())
    }

    /// Global frame index of `local` within animation `name`.
    pub fn global_frame(&self, name: &str, local: usize) -> Option<u32> {
        self.animation(name).and_then(|anim| anim.frames.get(local)).map(|frame| frame.frame)
    }

    pub fn validate(&self) -> Vec<SpritesheetIssue> {
        let mut issues = Vec::new();
        if self.animations.is_empty() {
            issues.push(SpritesheetIssue::error("spritesheet declares no animations"));
        }
        for (index, rect) in self.frames.iter().enumerate() {
            if !rect.is_finite() {
                issues.push(SpritesheetIssue::error(format!("frame {index} has a non-finite rectangle")));
            }
        }
        for anim in &self.animations {
            if anim.frames.is_empty() {
                issues.push(SpritesheetIssue::error(format!("animation '{}' has no frames", anim.name)));
            }
            for (position, step) in anim.frames.iter().enumerate() {
                if step.frame as usize >= self.frames.len() {
                    issues.push(SpritesheetIssue::error(format!(
                        "animation '{}' step {position} references missing frame {} ({} frames declared)",
                        anim.name,
                        step.frame,
                        self.frames.len()
                    )));
                }
                if !step.duration.is_finite() {
                    issues.push(SpritesheetIssue::error(format!(
                        "animation '{}' step {position} has a non-finite duration",
                        anim.name
                    )));
                }
            }
        }
        if !self.animation_lengths.is_empty() {
            let actual: Vec<u32> = self.animations.iter().map(|anim| anim.len() as u32).collect();
            if actual != self.animation_lengths {
                issues.push(SpritesheetIssue::warning(format!(
                    "animationLengths {:?} disagree with animation frame counts {:?}; frame counts win",
                    self.animation_lengths, actual
                )));
            }
        }
        issues
    }

    /// Fails on the first error-severity issue; warnings are logged.
    pub fn ensure_valid(&self) -> Result<()> {
        for issue in self.validate() {
            match issue.severity {
                IssueSeverity::Error => return Err(anyhow!("invalid spritesheet: {}", issue.message)),
                IssueSeverity::Warning => log::warn!("[spritesheet] {}", issue.message),
            }
        }
        Ok(())
    }
}

mod ordered_animations {
    use super::*;

    pub fn serialize<S: Serializer>(animations: &[SpriteAnimation], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(animations.len()))?;
        for anim in animations {
            map.serialize_entry(&anim.name, &anim.frames)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SpriteAnimation>, D::Error> {
        deserializer.deserialize_map(OrderedVisitor)
    }

    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<SpriteAnimation>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of animation name to [frame, duration] pairs")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut animations: Vec<SpriteAnimation> = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((name, frames)) = access.next_entry::<String, Vec<AnimationFrame>>()? {
                // Later duplicates replace earlier ones in place, like object key assignment.
                if let Some(existing) = animations.iter_mut().find(|anim| anim.name == name) {
                    existing.frames = frames;
                } else {
                    animations.push(SpriteAnimation { name, frames });
                }
            }
            Ok(animations)
        }
    }
}
