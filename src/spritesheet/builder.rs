//! Packs one or more source images into a single atlas and describes the result.

use super::{AnimationFrame, FrameRect, SpritesheetFormat};
use anyhow::{bail, Context, Result};
use image::RgbaImage;
use std::path::Path;

/// Pixel rectangle inside a single source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// How a source image is cut into frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Slicing {
    /// Uniform grid with the given number of columns and rows.
    RowColumn { columns: u32, rows: u32 },
    /// Uniform grid of cells with the given pixel size.
    FrameSize { width: u32, height: u32 },
    /// Explicit frames, in order.
    Custom(Vec<PixelRect>),
}

/// Named half-open range `[from, to)` of frames local to one source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRange {
    pub name: String,
    pub from: usize,
    pub to: usize,
}

impl FrameRange {
    pub fn new(name: impl Into<String>, from: usize, to: usize) -> Self {
        Self { name: name.into(), from, to }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnimationMeta {
    /// Every frame of the source becomes one animation.
    Single(String),
    /// The source holds several animations.
    Ranges(Vec<FrameRange>),
}

impl From<&str> for AnimationMeta {
    fn from(name: &str) -> Self {
        AnimationMeta::Single(name.to_string())
    }
}

struct SourceEntry {
    image: RgbaImage,
    slicing: Slicing,
    meta: AnimationMeta,
}

#[derive(Default)]
pub struct SpritesheetBuilder {
    sources: Vec<SourceEntry>,
}

pub fn load_image(path: impl AsRef<Path>) -> Result<RgbaImage> {
    let path = path.as_ref();
    let image = image::open(path).with_context(|| format!("Failed to load sprite image {}", path.display()))?;
    Ok(image.to_rgba8())
}

impl SpritesheetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, image: RgbaImage, slicing: Slicing, meta: impl Into<AnimationMeta>) -> Self {
        self.sources.push(SourceEntry { image, slicing, meta: meta.into() });
        self
    }

    pub fn add_path(self, path: impl AsRef<Path>, slicing: Slicing, meta: impl Into<AnimationMeta>) -> Result<Self> {
        let image = load_image(path)?;
        Ok(self.add(image, slicing, meta))
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Stacks the sources vertically and returns the spritesheet plus the atlas image.
    pub fn build(self) -> Result<(SpritesheetFormat, RgbaImage)> {
        if self.sources.is_empty() {
            bail!("spritesheet builder has no sources");
        }
        let atlas_w = self.sources.iter().map(|s| s.image.width()).max().unwrap_or(0);
        let atlas_h: u32 = self.sources.iter().map(|s| s.image.height()).sum();
        if atlas_w == 0 || atlas_h == 0 {
            bail!("spritesheet sources are empty ({atlas_w}x{atlas_h})");
        }
        let mut atlas = RgbaImage::new(atlas_w, atlas_h);
        let mut sheet = SpritesheetFormat::new(Vec::new(), [atlas_w, atlas_h]);

        let mut y_offset = 0u32;
        for (source_index, source) in self.sources.into_iter().enumerate() {
            image::imageops::replace(&mut atlas, &source.image, 0, i64::from(y_offset));
            let rects = slice_rects(&source.image, &source.slicing)
                .with_context(|| format!("Failed to slice sprite source {source_index}"))?;
            let first_global = sheet.frames.len() as u32;
            for rect in &rects {
                sheet.frames.push(FrameRect::new(
                    rect.x as f32 / atlas_w as f32,
                    (rect.y + y_offset) as f32 / atlas_h as f32,
                    rect.w as f32 / atlas_w as f32,
                    rect.h as f32 / atlas_h as f32,
                ));
            }
            match source.meta {
                AnimationMeta::Single(name) => {
                    let steps = (0..rects.len() as u32).map(|i| AnimationFrame::new(first_global + i, 1.0)).collect();
                    sheet.push_animation(name, steps);
                }
                AnimationMeta::Ranges(ranges) => {
                    for range in ranges {
                        if range.from > range.to || range.to > rects.len() {
                            bail!(
                                "frame range '{}' [{}, {}) is outside source {source_index} ({} frames)",
                                range.name,
                                range.from,
                                range.to,
                                rects.len()
                            );
                        }
                        let steps = (range.from..range.to)
                            .map(|local| AnimationFrame::new(first_global + local as u32, 1.0))
                            .collect();
                        sheet.push_animation(range.name, steps);
                    }
                }
            }
            y_offset += source.image.height();
        }
        Ok((sheet, atlas))
    }
}

fn slice_rects(image: &RgbaImage, slicing: &Slicing) -> Result<Vec<PixelRect>> {
    let (img_w, img_h) = image.dimensions();
    let (columns, rows) = match slicing {
        Slicing::RowColumn { columns, rows } => (*columns, *rows),
        Slicing::FrameSize { width, height } => {
            if *width == 0 || *height == 0 {
                bail!("frame size must be non-zero");
            }
            (img_w / width, img_h / height)
        }
        Slicing::Custom(rects) => {
            for rect in rects {
                if rect.x + rect.w > img_w || rect.y + rect.h > img_h {
                    bail!("custom frame {rect:?} exceeds source bounds {img_w}x{img_h}");
                }
            }
            return Ok(rects.clone());
        }
    };
    if columns == 0 || rows == 0 {
        bail!("slicing {slicing:?} yields no frames for a {img_w}x{img_h} source");
    }
    let cell_w = img_w / columns;
    let cell_h = img_h / rows;
    let mut rects = Vec::with_capacity((columns * rows) as usize);
    for row in 0..rows {
        for column in 0..columns {
            rects.push(PixelRect { x: column * cell_w, y: row * cell_h, w: cell_w, h: cell_h });
        }
    }
    Ok(rects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, value: u8) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([value, value, value, 255]))
    }

    #[test]
    fn stacks_sources_and_numbers_frames_globally() {
        let (sheet, atlas) = SpritesheetBuilder::new()
            .add(solid(64, 16, 10), Slicing::RowColumn { columns: 4, rows: 1 }, "idle")
            .add(solid(32, 32, 20), Slicing::FrameSize { width: 16, height: 16 }, "run")
            .build()
            .unwrap();
        assert_eq!(atlas.dimensions(), (64, 48));
        assert_eq!(sheet.sheet_size, [64, 48]);
        assert_eq!(sheet.frame_count(), 8);
        assert_eq!(sheet.animation_lengths, vec![4, 4]);
        assert_eq!(sheet.global_frame("run", 0), Some(4));
        let run0 = sheet.frames[4];
        assert_eq!(run0, FrameRect::new(0.0, 16.0 / 48.0, 0.25, 16.0 / 48.0));
        assert_eq!(atlas.get_pixel(0, 20)[0], 20);
        assert_eq!(atlas.get_pixel(40, 20)[3], 0, "area right of a narrow source stays transparent");
    }

    #[test]
    fn frame_ranges_are_half_open() {
        let (sheet, _) = SpritesheetBuilder::new()
            .add(
                solid(40, 10, 1),
                Slicing::RowColumn { columns: 4, rows: 1 },
                AnimationMeta::Ranges(vec![FrameRange::new("a", 0, 2), FrameRange::new("b", 2, 4)]),
            )
            .build()
            .unwrap();
        assert_eq!(sheet.animation("a").unwrap().len(), 2);
        assert_eq!(sheet.global_frame("b", 1), Some(3));
    }

    #[test]
    fn rejects_out_of_range_frames() {
        let result = SpritesheetBuilder::new()
            .add(
                solid(20, 10, 1),
                Slicing::RowColumn { columns: 2, rows: 1 },
                AnimationMeta::Ranges(vec![FrameRange::new("a", 0, 3)]),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn custom_rects_keep_declared_order() {
        let rects = vec![PixelRect { x: 8, y: 0, w: 8, h: 8 }, PixelRect { x: 0, y: 0, w: 8, h: 8 }];
        let (sheet, _) =
            SpritesheetBuilder::new().add(solid(16, 8, 1), Slicing::Custom(rects), "pair").build().unwrap();
        assert_eq!(sheet.frames[0].x, 0.5);
        assert_eq!(sheet.frames[1].x, 0.0);
    }
}
