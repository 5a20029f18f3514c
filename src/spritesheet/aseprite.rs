//! Aseprite JSON export support (`--format json-array` and `json-hash`).

use super::{AnimationFrame, FrameRect, SpritesheetFormat};
use crate::instructions::PlayMode;
use anyhow::{anyhow, bail, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct AsepriteFile {
    frames: AsepriteFrames,
    meta: AsepriteMeta,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AsepriteFrames {
    Array(Vec<AsepriteFrame>),
    Hash(FramesInDocumentOrder),
}

/// `json-hash` frames, in the order they appear in the file.
#[derive(Debug)]
struct FramesInDocumentOrder(Vec<AsepriteFrame>);

impl<'de> Deserialize<'de> for FramesInDocumentOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FrameHashVisitor)
    }
}

struct FrameHashVisitor;

impl<'de> Visitor<'de> for FrameHashVisitor {
    type Value = FramesInDocumentOrder;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of frame filename to Aseprite frame")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut frames = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, mut frame)) = access.next_entry::<String, AsepriteFrame>()? {
            frame.filename.get_or_insert(name);
            frames.push(frame);
        }
        Ok(FramesInDocumentOrder(frames))
    }
}

#[derive(Debug, Deserialize)]
struct AsepriteFrame {
    #[serde(default)]
    filename: Option<String>,
    frame: AsepriteRect,
    #[serde(default = "default_duration_ms")]
    duration: f32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct AsepriteRect {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

#[derive(Debug, Deserialize)]
struct AsepriteSize {
    w: u32,
    h: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AsepriteMeta {
    #[serde(default)]
    image: Option<String>,
    size: AsepriteSize,
    #[serde(default)]
    frame_tags: Vec<AsepriteTag>,
}

#[derive(Debug, Deserialize)]
struct AsepriteTag {
    name: String,
    from: usize,
    to: usize,
    #[serde(default)]
    direction: Option<String>,
}

const fn default_duration_ms() -> f32 {
    100.0
}

/// Result of importing an Aseprite export.
#[derive(Debug, Clone)]
pub struct AsepriteImport {
    pub spritesheet: SpritesheetFormat,
    /// Atlas image path as written by Aseprite (relative to the JSON file).
    pub image: Option<String>,
    /// Play mode suggested by each tag's `direction`, in animation order.
    pub tag_modes: Vec<(String, PlayMode)>,
}

pub fn load_aseprite(path: impl AsRef<Path>) -> Result<AsepriteImport> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("Failed to read Aseprite export {}", path.display()))?;
    parse_aseprite(&bytes).with_context(|| format!("Failed to import Aseprite export {}", path.display()))
}

/// Frame durations are kept in milliseconds as exported.
pub fn parse_aseprite(bytes: &[u8]) -> Result<AsepriteImport> {
    let file: AsepriteFile = serde_json::from_slice(bytes)?;
    let size = &file.meta.size;
    if size.w == 0 || size.h == 0 {
        bail!("Aseprite meta.size must be non-zero (got {}x{})", size.w, size.h);
    }
    let (sheet_w, sheet_h) = (size.w as f32, size.h as f32);

    // Global frame numbers follow document order in both export forms.
    let raw_frames: Vec<AsepriteFrame> = match file.frames {
        AsepriteFrames::Array(frames) => frames,
        AsepriteFrames::Hash(FramesInDocumentOrder(frames)) => frames,
    };

    let frames: Vec<FrameRect> = raw_frames
        .iter()
        .map(|f| FrameRect::new(f.frame.x / sheet_w, f.frame.y / sheet_h, f.frame.w / sheet_w, f.frame.h / sheet_h))
        .collect();
    let durations: Vec<f32> = raw_frames.iter().map(|f| f.duration).collect();

    let mut spritesheet = SpritesheetFormat::new(frames, [size.w, size.h]);
    let mut tag_modes = Vec::with_capacity(file.meta.frame_tags.len());
    for tag in file.meta.frame_tags {
        if tag.from > tag.to {
            bail!("Aseprite tag '{}' has from {} > to {}", tag.name, tag.from, tag.to);
        }
        let steps = (tag.from..=tag.to)
            .map(|index| {
                let duration = durations.get(index).copied().ok_or_else(|| {
                    anyhow!("Aseprite tag '{}' references missing frame {index} ({} frames)", tag.name, durations.len())
                })?;
                Ok(AnimationFrame::new(index as u32, duration))
            })
            .collect::<Result<Vec<_>>>()?;
        let mode = tag
            .direction
            .as_deref()
            .map(|direction| PlayMode::from_str(direction).unwrap_or(PlayMode::Forward))
            .unwrap_or(PlayMode::Forward);
        tag_modes.push((tag.name.clone(), mode));
        spritesheet.push_animation(tag.name, steps);
    }

    Ok(AsepriteImport { spritesheet, image: file.meta.image, tag_modes })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARRAY_EXPORT: &str = r#"{
      "frames": [
        { "filename": "f0", "frame": { "x": 0, "y": 0, "w": 32, "h": 32 }, "duration": 100 },
        { "filename": "f1", "frame": { "x": 32, "y": 0, "w": 32, "h": 32 }, "duration": 120 },
        { "filename": "f2", "frame": { "x": 0, "y": 32, "w": 32, "h": 32 }, "duration": 80 }
      ],
      "meta": {
        "image": "demo.png",
        "size": { "w": 64, "h": 64 },
        "frameTags": [
          { "name": "idle", "from": 0, "to": 1, "direction": "forward" },
          { "name": "bounce", "from": 1, "to": 2, "direction": "pingpong" }
        ]
      }
    }"#;

    #[test]
    fn parses_array_export() {
        let import = parse_aseprite(ARRAY_EXPORT.as_bytes()).unwrap();
        let sheet = &import.spritesheet;
        assert_eq!(sheet.frame_count(), 3);
        assert_eq!(sheet.frames[1], FrameRect::new(0.5, 0.0, 0.5, 0.5));
        assert_eq!(sheet.sheet_size, [64, 64]);
        assert_eq!(sheet.animation_lengths, vec![2, 2]);
        let idle = sheet.animation("idle").unwrap();
        assert_eq!(idle.frames, vec![AnimationFrame::new(0, 100.0), AnimationFrame::new(1, 120.0)]);
        assert_eq!(import.image.as_deref(), Some("demo.png"));
        assert_eq!(import.tag_modes[1], ("bounce".to_string(), PlayMode::PingPong));
    }

    #[test]
    fn parses_hash_export_in_document_order() {
        let json = r#"{
          "frames": {
            "b.png": { "frame": { "x": 16, "y": 0, "w": 16, "h": 16 }, "duration": 50 },
            "a.png": { "frame": { "x": 0, "y": 0, "w": 16, "h": 16 }, "duration": 50 }
          },
          "meta": { "size": { "w": 32, "h": 16 }, "frameTags": [{ "name": "all", "from": 0, "to": 1 }] }
        }"#;
        let import = parse_aseprite(json.as_bytes()).unwrap();
        assert_eq!(import.spritesheet.frames[0].x, 0.5);
        assert_eq!(import.spritesheet.frames[1].x, 0.0);
    }

    #[test]
    fn hash_export_with_many_frames_keeps_numbering() {
        let entries: Vec<String> = (0..11)
            .map(|i| {
                format!(r#""hero {i}.aseprite": {{ "frame": {{ "x": {i}, "y": 0, "w": 1, "h": 1 }}, "duration": 100 }}"#)
            })
            .collect();
        let meta = r#""meta": { "size": { "w": 11, "h": 1 }, "frameTags": [{ "name": "tail", "from": 8, "to": 10 }] }"#;
        let json = format!(r#"{{ "frames": {{ {} }}, {meta} }}"#, entries.join(", "));
        let import = parse_aseprite(json.as_bytes()).unwrap();
        let xs: Vec<f32> = import.spritesheet.frames.iter().map(|rect| rect.x * 11.0).collect();
        for (index, x) in xs.iter().enumerate() {
            assert!((x - index as f32).abs() < 1e-4, "frame {index} at x {x}");
        }
        let tail: Vec<u32> = import.spritesheet.animation("tail").unwrap().frames.iter().map(|f| f.frame).collect();
        assert_eq!(tail, vec![8, 9, 10]);
    }

    #[test]
    fn rejects_tags_past_the_last_frame() {
        let json = r#"{
          "frames": [{ "frame": { "x": 0, "y": 0, "w": 8, "h": 8 }, "duration": 100 }],
          "meta": { "size": { "w": 8, "h": 8 }, "frameTags": [{ "name": "oops", "from": 0, "to": 3 }] }
        }"#;
        let err = parse_aseprite(json.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("missing frame"));
    }
}
