//! Guaranteed local renderer.
//!
//! Produces a placeholder icon when no remote backend is usable: a rounded
//! accent tile with a symmetric 5×5 stamp derived from the prompt. The accent
//! colour comes from a fixed seed and the stamp from a blake3 digest of the
//! prompt, so the same prompt always yields the same PNG.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};

use super::{GenerationConstraints, ProviderError, ProviderResult, Submission};

/// Edge-length bounds applied to local renders.
pub const MIN_SIZE: u32 = 512;
pub const MAX_SIZE: u32 = 1440;

/// Seed used when none is configured.
pub const DEFAULT_SEED: u64 = 7;

const BACKGROUND: Rgba<u8> = Rgba([240, 243, 248, 255]);
const STAMP: Rgba<u8> = Rgba([255, 255, 255, 245]);
const INSET: u32 = 64;
const CORNER_RADIUS: u32 = 128;
const GRID: u32 = 5;

#[derive(Debug, Clone)]
pub struct LocalRenderer {
    seed: u64,
}

impl Default for LocalRenderer {
    fn default() -> Self {
        Self { seed: DEFAULT_SEED }
    }
}

impl LocalRenderer {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    pub async fn submit(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<Submission, ProviderError> {
        let size = constraints.size.clamp(MIN_SIZE, MAX_SIZE);
        let prompt = prompt.to_string();
        let seed = self.seed;

        // CPU-bound; keep it off the async workers.
        let png = tokio::task::spawn_blocking(move || render_png(&prompt, size, seed))
            .await
            .map_err(|e| ProviderError::Permanent(format!("local_render_join: {e}")))??;
        Ok(Submission::Ready(ProviderResult::Inline(png)))
    }
}

/// Render the placeholder and encode it as PNG.
pub fn render_png(prompt: &str, size: u32, seed: u64) -> Result<Vec<u8>, ProviderError> {
    let image = render(prompt, size, seed);
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| ProviderError::Permanent(format!("local_render_encode: {e}")))?;
    Ok(buffer.into_inner())
}

fn render(prompt: &str, size: u32, seed: u64) -> RgbaImage {
    let accent = accent_color(seed);
    let inset = INSET.min(size / 4);
    let radius = CORNER_RADIUS.min((size - 2 * inset) / 2);
    let (lo, hi) = (inset, size - inset);

    let mut image = RgbaImage::from_pixel(size, size, BACKGROUND);
    for y in lo..hi {
        for x in lo..hi {
            if inside_rounded(x, y, lo, hi, radius) {
                image.put_pixel(x, y, accent);
            }
        }
    }

    // Stamp occupies the middle 5 of 9 cells across the tile.
    let cell = (hi - lo) / 9;
    let origin = lo + (hi - lo - cell * GRID) / 2;
    let pattern = stamp_pattern(prompt);
    for row in 0..GRID {
        for col in 0..GRID {
            if !pattern[row as usize][col as usize] {
                continue;
            }
            let (x0, y0) = (origin + col * cell, origin + row * cell);
            for y in y0..y0 + cell {
                for x in x0..x0 + cell {
                    image.put_pixel(x, y, STAMP);
                }
            }
        }
    }
    image
}

fn accent_color(seed: u64) -> Rgba<u8> {
    let digest = blake3::hash(&seed.to_le_bytes());
    let bytes = digest.as_bytes();
    let channel = |b: u8| 80 + b % 121;
    Rgba([channel(bytes[0]), channel(bytes[1]), channel(bytes[2]), 255])
}

/// Left half from the digest bits, mirrored onto the right half.
fn stamp_pattern(prompt: &str) -> [[bool; GRID as usize]; GRID as usize] {
    let digest = blake3::hash(prompt.as_bytes());
    let bytes = digest.as_bytes();
    let mut pattern = [[false; GRID as usize]; GRID as usize];
    for row in 0..GRID as usize {
        for col in 0..3 {
            let bit = row * 3 + col;
            let on = bytes[bit / 8] >> (bit % 8) & 1 == 1;
            pattern[row][col] = on;
            pattern[row][GRID as usize - 1 - col] = on;
        }
    }
    pattern
}

fn inside_rounded(x: u32, y: u32, lo: u32, hi: u32, radius: u32) -> bool {
    let (x, y, lo, hi, r) = (x as i64, y as i64, lo as i64, hi as i64 - 1, radius as i64);
    let cx = if x < lo + r {
        lo + r
    } else if x > hi - r {
        hi - r
    } else {
        return true;
    };
    let cy = if y < lo + r {
        lo + r
    } else if y > hi - r {
        hi - r
    } else {
        return true;
    };
    let (dx, dy) = (x - cx, y - cy);
    dx * dx + dy * dy <= r * r
}
