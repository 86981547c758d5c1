//! Frame buffer planes and progressive accumulation.
//!
//! Workers hold the full set of planes and fold every rendered frame into
//! the accumulation buffer; the coordinator keeps a display-only mirror that
//! receives already-resolved tile blocks, so accumulation state never
//! crosses the wire.

use crate::core::errors::{BeamlineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Pixel storage layout for the color plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ColorFormat {
    None = 0,
    Rgba8 = 1,
    Srgba8 = 2,
    Rgba32f = 3,
}

impl ColorFormat {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Rgba8),
            2 => Some(Self::Srgba8),
            3 => Some(Self::Rgba32f),
            _ => None,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::None => 0,
            Self::Rgba8 | Self::Srgba8 => 4,
            Self::Rgba32f => 16,
        }
    }
}

/// Channel bits requested at frame buffer creation
pub mod channel {
    pub const COLOR: u32 = 1 << 0;
    pub const DEPTH: u32 = 1 << 1;
    pub const ACCUM: u32 = 1 << 2;
    pub const VARIANCE: u32 = 1 << 3;
    pub const NORMAL: u32 = 1 << 4;
    pub const ALBEDO: u32 = 1 << 5;
    pub const ID_PRIMITIVE: u32 = 1 << 6;
    pub const ID_OBJECT: u32 = 1 << 7;
    pub const ID_INSTANCE: u32 = 1 << 8;
}

struct Planes {
    resolved: Vec<[f32; 4]>,
    accum: Option<Vec<[f32; 4]>>,
    depth: Option<Vec<f32>>,
    /// Per-region convergence estimate, keyed by region origin
    region_error: HashMap<(u32, u32), f32>,
    frames: u32,
}

/// Pixel planes for one frame buffer instance.
///
/// All plane access goes through one lock; regions are disjoint per tile so
/// contention is limited to the map update at tile granularity.
pub struct FrameBufferState {
    width: u32,
    height: u32,
    format: ColorFormat,
    channels: u32,
    planes: Mutex<Planes>,
}

impl FrameBufferState {
    /// Worker-side buffer: carries accumulation state when `ACCUM` was
    /// requested, plus the per-region error estimates behind `VARIANCE`.
    pub fn with_accumulation(width: u32, height: u32, format: ColorFormat, channels: u32) -> Self {
        Self::build(width, height, format, channels, true)
    }

    /// Coordinator-side mirror: resolved pixels only, accumulation and
    /// variance tracking stripped.
    pub fn display_only(width: u32, height: u32, format: ColorFormat, channels: u32) -> Self {
        Self::build(width, height, format, channels, false)
    }

    fn build(
        width: u32,
        height: u32,
        format: ColorFormat,
        channels: u32,
        keep_accumulation: bool,
    ) -> Self {
        let pixels = (width as usize) * (height as usize);
        let accum = (keep_accumulation && channels & channel::ACCUM != 0)
            .then(|| vec![[0.0; 4]; pixels]);
        let depth = (channels & channel::DEPTH != 0).then(|| vec![f32::INFINITY; pixels]);
        Self {
            width,
            height,
            format,
            channels,
            planes: Mutex::new(Planes {
                resolved: vec![[0.0; 4]; pixels],
                accum,
                depth,
                region_error: HashMap::new(),
                frames: 0,
            }),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> ColorFormat {
        self.format
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn has_channel(&self, bit: u32) -> bool {
        self.channels & bit != 0
    }

    /// Completed accumulation frames
    pub fn frames(&self) -> u32 {
        self.planes.lock().frames
    }

    /// Fold one rendered region into the accumulation plane and return the
    /// resolved pixel block for that region. Without an accumulation plane
    /// the samples pass through unchanged. The block must carry one sample
    /// per declared pixel; short blocks are rejected before any plane is
    /// touched.
    pub fn accumulate_region(
        &self,
        x: u32,
        y: u32,
        region_width: u32,
        region_height: u32,
        samples: &[[f32; 4]],
        depth: Option<&[f32]>,
    ) -> Result<Vec<[f32; 4]>> {
        covers_region("sample", samples.len(), region_width, region_height)?;
        if let Some(values) = depth {
            covers_region("depth", values.len(), region_width, region_height)?;
        }
        let mut planes = self.planes.lock();
        let weight = 1.0 / (planes.frames as f32 + 1.0);
        let mut resolved_block = Vec::with_capacity(samples.len());
        let mut error_sum = 0.0f32;

        for row in 0..region_height.min(self.height.saturating_sub(y)) {
            for col in 0..region_width.min(self.width.saturating_sub(x)) {
                let src = (row * region_width + col) as usize;
                let dst = ((y + row) * self.width + (x + col)) as usize;
                let sample = samples[src];

                let resolved = match planes.accum.as_mut() {
                    Some(accum) => {
                        let prev = accum[dst];
                        let mixed = [
                            prev[0] + (sample[0] - prev[0]) * weight,
                            prev[1] + (sample[1] - prev[1]) * weight,
                            prev[2] + (sample[2] - prev[2]) * weight,
                            prev[3] + (sample[3] - prev[3]) * weight,
                        ];
                        accum[dst] = mixed;
                        error_sum += (sample[0] - mixed[0]).abs()
                            + (sample[1] - mixed[1]).abs()
                            + (sample[2] - mixed[2]).abs();
                        mixed
                    }
                    None => sample,
                };
                planes.resolved[dst] = resolved;
                resolved_block.push(resolved);

                if let (Some(plane), Some(values)) = (planes.depth.as_mut(), depth) {
                    plane[dst] = plane[dst].min(values[src]);
                }
            }
        }

        if self.has_channel(channel::VARIANCE) {
            let pixels = (region_width * region_height).max(1) as f32;
            planes.region_error.insert((x, y), error_sum / pixels);
        }
        Ok(resolved_block)
    }

    /// Store an already-resolved block arriving from a tile owner. Blocks
    /// shorter than their declared region are rejected.
    pub fn write_resolved_region(
        &self,
        x: u32,
        y: u32,
        region_width: u32,
        region_height: u32,
        pixels: &[[f32; 4]],
    ) -> Result<()> {
        covers_region("resolved", pixels.len(), region_width, region_height)?;
        let mut planes = self.planes.lock();
        for row in 0..region_height.min(self.height.saturating_sub(y)) {
            for col in 0..region_width.min(self.width.saturating_sub(x)) {
                let src = (row * region_width + col) as usize;
                let dst = ((y + row) * self.width + (x + col)) as usize;
                planes.resolved[dst] = pixels[src];
            }
        }
        Ok(())
    }

    /// Convergence estimate for a region; unseen regions report infinity
    pub fn region_error(&self, x: u32, y: u32) -> f32 {
        self.planes
            .lock()
            .region_error
            .get(&(x, y))
            .copied()
            .unwrap_or(f32::INFINITY)
    }

    pub fn end_frame(&self) {
        self.planes.lock().frames += 1;
    }

    /// Drop accumulated state so the next frame starts from scratch
    pub fn reset_accumulation(&self) {
        let mut planes = self.planes.lock();
        planes.frames = 0;
        planes.region_error.clear();
        if let Some(accum) = planes.accum.as_mut() {
            accum.iter_mut().for_each(|px| *px = [0.0; 4]);
        }
        if let Some(depth) = planes.depth.as_mut() {
            depth.iter_mut().for_each(|d| *d = f32::INFINITY);
        }
    }

    /// Resolved color plane converted to the declared format
    pub fn color_bytes(&self) -> Vec<u8> {
        let planes = self.planes.lock();
        match self.format {
            ColorFormat::None => Vec::new(),
            ColorFormat::Rgba8 => planes
                .resolved
                .iter()
                .flat_map(|px| px.map(to_byte))
                .collect(),
            ColorFormat::Srgba8 => planes
                .resolved
                .iter()
                .flat_map(|px| {
                    [
                        to_byte(srgb_encode(px[0])),
                        to_byte(srgb_encode(px[1])),
                        to_byte(srgb_encode(px[2])),
                        to_byte(px[3]),
                    ]
                })
                .collect(),
            ColorFormat::Rgba32f => planes
                .resolved
                .iter()
                .flat_map(|px| {
                    let mut bytes = [0u8; 16];
                    for (i, c) in px.iter().enumerate() {
                        bytes[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
                    }
                    bytes
                })
                .collect(),
        }
    }

    /// Depth plane snapshot, present only when the channel was requested
    pub fn depth_plane(&self) -> Option<Vec<f32>> {
        self.planes.lock().depth.clone()
    }
}

fn covers_region(plane: &str, len: usize, width: u32, height: u32) -> Result<()> {
    let needed = (width as usize) * (height as usize);
    if len < needed {
        return Err(BeamlineError::internal(format!(
            "{plane} block holds {len} entries for a {width}x{height} region"
        )));
    }
    Ok(())
}

fn to_byte(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn srgb_encode(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}
