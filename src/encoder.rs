//! Flattens a [`SpritesheetFormat`] into the fixed-layout RGBA32F table read by the
//! animation kernel and the sprite fragment shader.
//!
//! Rows, top to bottom:
//! * row 0: frame rectangles `(x, y, w, h)`, one cell per global frame
//! * row 1: animation lengths `(len, 0, 0, 0)`, one cell per animation
//! * row 2 + k: steps of animation `k` as `(global frame, duration, 0, 0)`
//!
//! Every row is zero-padded to the table width.

use crate::spritesheet::SpritesheetFormat;
use anyhow::{bail, Result};
use std::collections::HashMap;

pub const FRAME_ROW: u32 = 0;
pub const LENGTH_ROW: u32 = 1;
pub const FIRST_ANIMATION_ROW: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSpritesheet {
    cells: Vec<[f32; 4]>,
    width: u32,
    height: u32,
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl EncodedSpritesheet {
    pub fn encode(sheet: &SpritesheetFormat) -> Result<Self> {
        if sheet.animations.is_empty() {
            bail!("cannot encode a spritesheet without animations");
        }
        for anim in &sheet.animations {
            if anim.frames.is_empty() {
                bail!("cannot encode animation '{}' without frames", anim.name);
            }
            if let Some(step) = anim.frames.iter().find(|step| step.frame as usize >= sheet.frames.len()) {
                bail!(
                    "animation '{}' references frame {} but only {} frames exist",
                    anim.name,
                    step.frame,
                    sheet.frames.len()
                );
            }
        }

        let longest = sheet.animations.iter().map(|anim| anim.len()).max().unwrap_or(0);
        let width = sheet.frames.len().max(sheet.animations.len()).max(longest);
        let height = FIRST_ANIMATION_ROW as usize + sheet.animations.len();
        let mut cells = vec![[0.0_f32; 4]; width * height];

        for (column, rect) in sheet.frames.iter().enumerate() {
            cells[FRAME_ROW as usize * width + column] = rect.to_array();
        }

        let mut names = Vec::with_capacity(sheet.animations.len());
        let mut index = HashMap::with_capacity(sheet.animations.len());
        for (anim_id, anim) in sheet.animations.iter().enumerate() {
            cells[LENGTH_ROW as usize * width + anim_id] = [anim.len() as f32, 0.0, 0.0, 0.0];
            let row = (FIRST_ANIMATION_ROW as usize + anim_id) * width;
            for (column, step) in anim.frames.iter().enumerate() {
                cells[row + column] = [step.frame as f32, step.duration, 0.0, 0.0];
            }
            names.push(anim.name.clone());
            index.insert(anim.name.clone(), anim_id as u32);
        }

        Ok(Self { cells, width: width as u32, height: height as u32, names, index })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn cells(&self) -> &[[f32; 4]] {
        &self.cells
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cells)
    }

    /// Out-of-range reads return a zero cell, like a clamped texture border of padding.
    pub fn cell(&self, column: u32, row: u32) -> [f32; 4] {
        if column >= self.width || row >= self.height {
            return [0.0; 4];
        }
        self.cells[(row * self.width + column) as usize]
    }

    pub fn frame_rect(&self, frame: u32) -> [f32; 4] {
        self.cell(frame, FRAME_ROW)
    }

    pub fn animation_count(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn animation_length(&self, animation: u32) -> u32 {
        if animation >= self.animation_count() {
            return 0;
        }
        self.cell(animation, LENGTH_ROW)[0] as u32
    }

    pub fn animation_frame(&self, animation: u32, column: u32) -> u32 {
        if animation >= self.animation_count() {
            return 0;
        }
        self.cell(column, FIRST_ANIMATION_ROW + animation)[0] as u32
    }

    pub fn animation_row(&self, name: &str) -> Option<u32> {
        self.animation_index(name).map(|id| FIRST_ANIMATION_ROW + id)
    }

    pub fn animation_index(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn animation_name(&self, animation: u32) -> Option<&str> {
        self.names.get(animation as usize).map(String::as_str)
    }

    /// Animation names in id order.
    pub fn animation_names(&self) -> &[String] {
        &self.names
    }
}
