// SPDX-License-Identifier: CEPL-1.0
//! CPU side of the text overlay: lays strings out as glyph quads over a
//! 16x16 ASCII atlas. Each glyph is one 4-vertex triangle strip.

use bytemuck::{Pod, Zeroable};
use lantern_math::pixel_to_ndc;
use tracing::debug;

/// Upper bound on glyphs per frame; sizes the per-image vertex buffers.
pub const OVERLAY_MAX_CHARS: usize = 2048;
pub const VERTS_PER_GLYPH: usize = 4;
pub const ATLAS_COLS: u32 = 16;
pub const ATLAS_ROWS: u32 = 16;

/// `xy` in NDC, `zw` atlas UV. Matches text.vert's `vec4 inPosUv`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GlyphVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// Atlas cell UV rectangle `(u0, v0, u1, v1)` for a byte.
pub fn glyph_uv(byte: u8) -> [f32; 4] {
    let col = byte as u32 % ATLAS_COLS;
    let row = byte as u32 / ATLAS_COLS;
    let w = 1.0 / ATLAS_COLS as f32;
    let h = 1.0 / ATLAS_ROWS as f32;
    [col as f32 * w, row as f32 * h, (col + 1) as f32 * w, (row + 1) as f32 * h]
}

/// Staged glyph quads for one frame, built by a begin/add/end cycle.
#[derive(Debug)]
pub struct TextBatch {
    glyph_px: f32,
    width: f32,
    height: f32,
    vertices: Vec<GlyphVertex>,
    updating: bool,
    dropped: usize,
}

impl TextBatch {
    pub fn new(glyph_px: f32) -> Self {
        Self {
            glyph_px: glyph_px.max(1.0),
            width: 1.0,
            height: 1.0,
            vertices: Vec::with_capacity(OVERLAY_MAX_CHARS * VERTS_PER_GLYPH),
            updating: false,
            dropped: 0,
        }
    }

    /// Start a new frame of text against a target of `width` x `height` pixels.
    pub fn begin(&mut self, width: u32, height: u32) {
        self.vertices.clear();
        self.width = width.max(1) as f32;
        self.height = height.max(1) as f32;
        self.updating = true;
        self.dropped = 0;
    }

    /// Lay out `text` with its anchor at pixel (`x`, `y`). Returns glyphs emitted.
    pub fn add(&mut self, text: &str, x: f32, y: f32, align: TextAlign) -> usize {
        if !self.updating {
            return 0;
        }
        let advance = self.glyph_px;
        let line_width = text.chars().count() as f32 * advance;
        let mut pen_x = match align {
            TextAlign::Left => x,
            TextAlign::Center => x - line_width * 0.5,
            TextAlign::Right => x - line_width,
        };

        let mut emitted = 0;
        for ch in text.chars() {
            let byte = if ch.is_ascii() { ch as u8 } else { b'?' };
            if byte != b' ' && !byte.is_ascii_control() {
                if self.glyph_count() >= OVERLAY_MAX_CHARS {
                    self.dropped += 1;
                } else {
                    self.push_quad(pen_x, y, byte);
                    emitted += 1;
                }
            }
            pen_x += advance;
        }
        emitted
    }

    /// Close the cycle; `vertices()` is stable until the next `begin`.
    pub fn end(&mut self) {
        if self.dropped > 0 {
            debug!("text overlay full, dropped {} glyphs", self.dropped);
        }
        self.updating = false;
    }

    pub fn glyph_count(&self) -> usize {
        self.vertices.len() / VERTS_PER_GLYPH
    }

    pub fn vertices(&self) -> &[GlyphVertex] {
        &self.vertices
    }

    fn push_quad(&mut self, px: f32, py: f32, byte: u8) {
        let (x0, y0) = pixel_to_ndc(px, py, self.width, self.height);
        let (x1, y1) = pixel_to_ndc(px + self.glyph_px, py + self.glyph_px, self.width, self.height);
        let [u0, v0, u1, v1] = glyph_uv(byte);
        // strip order: TL, BL, TR, BR
        self.vertices.extend_from_slice(&[
            GlyphVertex { pos: [x0, y0], uv: [u0, v0] },
            GlyphVertex { pos: [x0, y1], uv: [u0, v1] },
            GlyphVertex { pos: [x1, y0], uv: [u1, v0] },
            GlyphVertex { pos: [x1, y1], uv: [u1, v1] },
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_aligned_glyph_lands_at_anchor() {
        let mut t = TextBatch::new(16.0);
        t.begin(128, 128);
        assert_eq!(t.add("A", 0.0, 0.0, TextAlign::Left), 1);
        t.end();
        let v = t.vertices();
        assert_eq!(v.len(), 4);
        assert_eq!(v[0].pos, [-1.0, -1.0]);
        assert_eq!(v[3].pos, [-0.75, -0.75]);
        assert_eq!(v[0].uv, glyph_uv(b'A')[..2]);
    }

    #[test]
    fn spaces_advance_without_quads() {
        let mut t = TextBatch::new(10.0);
        t.begin(100, 100);
        assert_eq!(t.add("a b", 0.0, 0.0, TextAlign::Left), 2);
        let second = t.vertices()[4].pos[0];
        let (expected, _) = pixel_to_ndc(20.0, 0.0, 100.0, 100.0);
        assert!((second - expected).abs() < 1e-6);
    }

    #[test]
    fn center_and_right_alignment_shift_by_line_width() {
        let mut t = TextBatch::new(10.0);
        t.begin(200, 100);
        t.add("abcd", 100.0, 0.0, TextAlign::Center);
        t.add("abcd", 100.0, 0.0, TextAlign::Right);
        let (center_x, _) = pixel_to_ndc(80.0, 0.0, 200.0, 100.0);
        let (right_x, _) = pixel_to_ndc(60.0, 0.0, 200.0, 100.0);
        assert!((t.vertices()[0].pos[0] - center_x).abs() < 1e-6);
        assert!((t.vertices()[16].pos[0] - right_x).abs() < 1e-6);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut t = TextBatch::new(1.0);
        t.begin(10, 10);
        let long = "x".repeat(OVERLAY_MAX_CHARS + 10);
        assert_eq!(t.add(&long, 0.0, 0.0, TextAlign::Left), OVERLAY_MAX_CHARS);
        assert_eq!(t.add("y", 0.0, 0.0, TextAlign::Left), 0);
        assert_eq!(t.glyph_count(), OVERLAY_MAX_CHARS);
    }

    #[test]
    fn add_outside_cycle_is_ignored() {
        let mut t = TextBatch::new(16.0);
        assert_eq!(t.add("late", 0.0, 0.0, TextAlign::Left), 0);
        t.begin(64, 64);
        t.add("ok", 0.0, 0.0, TextAlign::Left);
        t.end();
        assert_eq!(t.add("late", 0.0, 0.0, TextAlign::Left), 0);
        assert_eq!(t.glyph_count(), 2);
    }

    #[test]
    fn atlas_cells_cover_unit_square() {
        assert_eq!(glyph_uv(0), [0.0, 0.0, 1.0 / 16.0, 1.0 / 16.0]);
        assert_eq!(glyph_uv(255), [15.0 / 16.0, 15.0 / 16.0, 1.0, 1.0]);
    }
}
