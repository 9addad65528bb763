//! Debug visualizer for the frame pipeline's intermediates.
//!
//! Each frame may deposit a snapshot of the network input groups and raw
//! outputs. The visualizer draws them over the output image either as a
//! 4x4 tile grid or as a single full-frame tile, and the snapshot is
//! consumed by the draw: it never outlives one presentation.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::model::{ModelPrecision, OutputTensor, OUTPUT_TENSOR_COUNT};
use crate::preprocess::{
    CH_CURRENT_COLOR, CH_DISOCCLUSION, CH_LUMA_DERIVATIVE, CH_WARPED_COLOR, CH_WARPED_FEEDBACK,
};
use crate::types::{Extent, TensorBuf, Texture};

pub const GRID_COLS: u32 = 4;
pub const GRID_ROWS: u32 = 4;
pub const TILE_PADDING: u32 = 10;

/// One frame's captured intermediates, in semantic output order.
#[derive(Debug, Clone)]
pub struct DebugSnapshot {
    pub precision: ModelPrecision,
    pub preprocessed: TensorBuf,
    pub depth_offset: Arc<Texture>,
    /// Indexed by [`OutputTensor::ordinal`].
    pub outputs: Vec<TensorBuf>,
}

/// Holder for at most one pending snapshot per view. Invalidated at the
/// start of every frame and again when a draw consumes it.
#[derive(Default)]
pub struct DebugSnapshotCell {
    inner: Mutex<Option<DebugSnapshot>>,
}

impl DebugSnapshotCell {
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    pub fn store(&self, snapshot: DebugSnapshot) {
        *self.lock() = Some(snapshot);
    }

    pub fn is_valid(&self) -> bool {
        self.lock().is_some()
    }

    /// Consumes the pending snapshot, leaving the cell invalid.
    pub fn take_for_draw(&self) -> Option<DebugSnapshot> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DebugSnapshot>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything the visualizer can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugTile {
    WarpedPrevColor,
    JitteredColor,
    DisocclusionMask,
    WarpedFeedback,
    LumaDerivative,
    ClosestDepthOffset,
    Feedback,
    ThetaAlpha,
    KpnFilterCol0,
    KpnFilterCol1,
    KpnFilterCol2,
    KpnFilterCol3,
}

impl DebugTile {
    /// Enumeration order is the tile index exposed to the single-tile debug
    /// levels: the five input groups, closest depth offset, then the kernel
    /// filter columns from 3 down to 0, feedback, theta/alpha.
    pub const ALL: [DebugTile; 12] = [
        DebugTile::WarpedPrevColor,
        DebugTile::JitteredColor,
        DebugTile::DisocclusionMask,
        DebugTile::WarpedFeedback,
        DebugTile::LumaDerivative,
        DebugTile::ClosestDepthOffset,
        DebugTile::KpnFilterCol3,
        DebugTile::KpnFilterCol2,
        DebugTile::KpnFilterCol1,
        DebugTile::KpnFilterCol0,
        DebugTile::Feedback,
        DebugTile::ThetaAlpha,
    ];

    pub fn from_index(index: usize) -> Option<DebugTile> {
        Self::ALL.get(index).copied()
    }

    pub fn label(&self) -> &'static str {
        match self {
            DebugTile::WarpedPrevColor => "warped prev color",
            DebugTile::JitteredColor => "jittered color",
            DebugTile::DisocclusionMask => "disocclusion mask",
            DebugTile::WarpedFeedback => "warped feedback",
            DebugTile::LumaDerivative => "luma derivative",
            DebugTile::ClosestDepthOffset => "closest depth offset",
            DebugTile::Feedback => "feedback",
            DebugTile::ThetaAlpha => "theta/alpha",
            DebugTile::KpnFilterCol0 => "kpn filter col 0",
            DebugTile::KpnFilterCol1 => "kpn filter col 1",
            DebugTile::KpnFilterCol2 => "kpn filter col 2",
            DebugTile::KpnFilterCol3 => "kpn filter col 3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlacement {
    pub tile: DebugTile,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Grid slots for a 4x4 layout with 10px gutters. Rows whose top edge falls
/// in the middle band of the image (`[H/4, 3H/4)`) keep only their outer
/// two columns so the image center stays visible, leaving exactly twelve
/// tiles.
pub fn grid_layout(output: Extent) -> Vec<TilePlacement> {
    let tile_w = output.width.saturating_sub((GRID_COLS + 1) * TILE_PADDING) / GRID_COLS;
    let tile_h = output.height.saturating_sub((GRID_ROWS + 1) * TILE_PADDING) / GRID_ROWS;

    let band_start = output.height / 4;
    let band_end = output.height * 3 / 4;

    let mut placements = Vec::with_capacity(DebugTile::ALL.len());
    let mut next_tile = DebugTile::ALL.iter().copied();
    for row in 0..GRID_ROWS {
        let y = TILE_PADDING + row * (tile_h + TILE_PADDING);
        let in_band = y >= band_start && y < band_end;
        for col in 0..GRID_COLS {
            if in_band && col != 0 && col != GRID_COLS - 1 {
                continue;
            }
            let Some(tile) = next_tile.next() else {
                return placements;
            };
            placements.push(TilePlacement {
                tile,
                x: TILE_PADDING + col * (tile_w + TILE_PADDING),
                y,
                width: tile_w,
                height: tile_h,
            });
        }
    }
    placements
}

/// Text the caller should draw on top of the image; the visualizer itself
/// only writes texels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLabel {
    pub text: String,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugOverlay {
    pub labels: Vec<DebugLabel>,
}

/// Draws the debug visualization for `level` over `image` and returns the
/// labels to render. Consumes the pending snapshot; returns `None` when the
/// level is zero or no valid snapshot exists.
pub fn render_overlay(
    cell: &DebugSnapshotCell,
    image: &mut Texture,
    level: u8,
) -> Option<DebugOverlay> {
    if level == 0 {
        return None;
    }
    let snapshot = cell.take_for_draw()?;
    let precision = snapshot.precision.label();
    let mut overlay = DebugOverlay::default();

    match level {
        1 => {
            overlay.labels.push(DebugLabel {
                text: format!("tempra debug ({precision})"),
                x: TILE_PADDING,
                y: TILE_PADDING,
            });
            // The basic overlay keeps the network's recurrent state visible
            // without covering the image: only the feedback and theta/alpha
            // tiles are drawn, in their usual grid slots.
            for placement in grid_layout(image.desc.extent) {
                if placement.tile != DebugTile::Feedback
                    && placement.tile != DebugTile::ThetaAlpha
                {
                    continue;
                }
                draw_tile(&snapshot, &placement, image);
                overlay.labels.push(DebugLabel {
                    text: format!("{} ({precision})", placement.tile.label()),
                    x: placement.x,
                    y: placement.y,
                });
            }
        }
        2 => {
            for placement in grid_layout(image.desc.extent) {
                draw_tile(&snapshot, &placement, image);
                overlay.labels.push(DebugLabel {
                    text: format!("{} ({precision})", placement.tile.label()),
                    x: placement.x,
                    y: placement.y,
                });
            }
        }
        _ => {
            let index = (level - 3) as usize;
            let Some(tile) = DebugTile::from_index(index) else {
                warn!(level, "debug level selects no tile");
                return Some(overlay);
            };
            let extent = image.desc.extent;
            let placement = TilePlacement {
                tile,
                x: 0,
                y: 0,
                width: extent.width,
                height: extent.height,
            };
            draw_tile(&snapshot, &placement, image);
            overlay.labels.push(DebugLabel {
                text: format!("{} ({precision})", tile.label()),
                x: TILE_PADDING,
                y: TILE_PADDING,
            });
        }
    }
    Some(overlay)
}

fn draw_tile(snapshot: &DebugSnapshot, placement: &TilePlacement, image: &mut Texture) {
    if placement.width == 0 || placement.height == 0 {
        return;
    }
    let extent = image.desc.extent;
    for ty in 0..placement.height {
        for tx in 0..placement.width {
            let x = placement.x + tx;
            let y = placement.y + ty;
            if x >= extent.width || y >= extent.height {
                continue;
            }
            let u = (tx as f32 + 0.5) / placement.width as f32;
            let v = (ty as f32 + 0.5) / placement.height as f32;
            let rgb = tile_value(snapshot, placement.tile, u, v);
            let texel = image.texel_mut(x, y);
            texel[0] = rgb[0];
            texel[1] = rgb[1];
            texel[2] = rgb[2];
            if texel.len() > 3 {
                texel[3] = 1.0;
            }
        }
    }
}

fn output_value(snapshot: &DebugSnapshot, tensor: OutputTensor, u: f32, v: f32) -> [f32; 3] {
    let buf = &snapshot.outputs[tensor.ordinal()];
    let x = (u * buf.shape[2] as f32) as i64;
    let y = (v * buf.shape[1] as f32) as i64;
    [buf.get(y, x, 0), buf.get(y, x, 1), buf.get(y, x, 2)]
}

fn input_channels(snapshot: &DebugSnapshot, base: usize, lanes: usize, u: f32, v: f32) -> [f32; 3] {
    let buf = &snapshot.preprocessed;
    let x = (u * buf.shape[2] as f32) as i64;
    let y = (v * buf.shape[1] as f32) as i64;
    let mut rgb = [0.0f32; 3];
    for (c, lane) in rgb.iter_mut().enumerate() {
        *lane = buf.get(y, x, base + c.min(lanes - 1));
    }
    rgb
}

fn tile_value(snapshot: &DebugSnapshot, tile: DebugTile, u: f32, v: f32) -> [f32; 3] {
    match tile {
        DebugTile::WarpedPrevColor => input_channels(snapshot, CH_WARPED_COLOR, 3, u, v),
        DebugTile::JitteredColor => input_channels(snapshot, CH_CURRENT_COLOR, 3, u, v),
        DebugTile::DisocclusionMask => input_channels(snapshot, CH_DISOCCLUSION, 1, u, v),
        DebugTile::WarpedFeedback => input_channels(snapshot, CH_WARPED_FEEDBACK, 3, u, v),
        DebugTile::LumaDerivative => input_channels(snapshot, CH_LUMA_DERIVATIVE, 1, u, v),
        DebugTile::ClosestDepthOffset => {
            let texture = snapshot.depth_offset.as_ref();
            let x = (u * texture.desc.extent.width as f32) as i64;
            let y = (v * texture.desc.extent.height as f32) as i64;
            let value = texture.load(x, y, 0);
            [value, value, value]
        }
        DebugTile::Feedback => output_value(snapshot, OutputTensor::Feedback, u, v),
        DebugTile::ThetaAlpha => output_value(snapshot, OutputTensor::ThetaAlpha, u, v),
        DebugTile::KpnFilterCol0 => output_value(snapshot, OutputTensor::KpnFilterCol0, u, v),
        DebugTile::KpnFilterCol1 => output_value(snapshot, OutputTensor::KpnFilterCol1, u, v),
        DebugTile::KpnFilterCol2 => output_value(snapshot, OutputTensor::KpnFilterCol2, u, v),
        DebugTile::KpnFilterCol3 => output_value(snapshot, OutputTensor::KpnFilterCol3, u, v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OUTPUT_CHANNELS;
    use crate::types::{TensorDtype, TextureFormat};

    fn snapshot() -> DebugSnapshot {
        let mut preprocessed = TensorBuf::zeroed(TensorDtype::F32, [1, 8, 8, 12]);
        for y in 0..8 {
            for x in 0..8 {
                preprocessed.set(y, x, CH_DISOCCLUSION, 1.0);
            }
        }
        DebugSnapshot {
            precision: ModelPrecision::Float32,
            preprocessed,
            depth_offset: Arc::new(Texture::new(Extent::new(8, 8), TextureFormat::R32F)),
            outputs: (0..OUTPUT_TENSOR_COUNT)
                .map(|_| TensorBuf::zeroed(TensorDtype::F32, [1, 8, 8, OUTPUT_CHANNELS]))
                .collect(),
        }
    }

    #[test]
    fn test_grid_layout_has_twelve_tiles() {
        let placements = grid_layout(Extent::new(1920, 1080));
        assert_eq!(placements.len(), 12);
        // Every enumerated tile appears exactly once, in declaration order.
        for (placement, tile) in placements.iter().zip(DebugTile::ALL) {
            assert_eq!(placement.tile, tile);
        }
    }

    #[test]
    fn test_grid_layout_middle_band_keeps_outer_columns() {
        let extent = Extent::new(1920, 1080);
        let placements = grid_layout(extent);
        let band_start = extent.height / 4;
        let band_end = extent.height * 3 / 4;

        let mut band_xs: Vec<u32> = placements
            .iter()
            .filter(|p| p.y >= band_start && p.y < band_end)
            .map(|p| p.x)
            .collect();
        band_xs.sort_unstable();
        band_xs.dedup();
        // Middle-band rows only use the leftmost and rightmost columns.
        assert_eq!(band_xs.len(), 2);
        assert_eq!(band_xs[0], TILE_PADDING);

        let outside: Vec<&TilePlacement> = placements
            .iter()
            .filter(|p| p.y < band_start || p.y >= band_end)
            .collect();
        assert_eq!(outside.len(), 8);
    }

    #[test]
    fn test_tile_enumeration_order() {
        let expected = [
            "warped prev color",
            "jittered color",
            "disocclusion mask",
            "warped feedback",
            "luma derivative",
            "closest depth offset",
            "kpn filter col 3",
            "kpn filter col 2",
            "kpn filter col 1",
            "kpn filter col 0",
            "feedback",
            "theta/alpha",
        ];
        let labels: Vec<&str> = DebugTile::ALL.iter().map(DebugTile::label).collect();
        assert_eq!(labels, expected);
        for (index, tile) in DebugTile::ALL.iter().enumerate() {
            assert_eq!(DebugTile::from_index(index), Some(*tile));
        }
    }

    #[test]
    fn test_level_one_draws_header_and_recurrent_tiles() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        let mut image = Texture::new(Extent::new(640, 360), TextureFormat::Rgba32F);
        let before = image.texels.clone();
        let overlay = render_overlay(&cell, &mut image, 1).expect("overlay");
        assert_eq!(overlay.labels.len(), 3);
        assert!(overlay.labels[0].text.contains("float32"));
        assert!(overlay.labels[1].text.starts_with("feedback"));
        assert!(overlay.labels[2].text.starts_with("theta/alpha"));
        assert_ne!(image.texels, before);
    }

    #[test]
    fn test_level_two_draws_grid_with_labels() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        let mut image = Texture::new(Extent::new(640, 360), TextureFormat::Rgba32F);
        let overlay = render_overlay(&cell, &mut image, 2).expect("overlay");
        assert_eq!(overlay.labels.len(), 12);
        assert!(overlay
            .labels
            .iter()
            .all(|label| label.text.ends_with("(float32)")));
        // The disocclusion tile drew non-zero texels.
        assert!(image.texels.iter().any(|&t| t > 0.0));
    }

    #[test]
    fn test_quantized_snapshot_labels_say_so() {
        let cell = DebugSnapshotCell::default();
        let mut quantized = snapshot();
        quantized.precision = ModelPrecision::Quantized8;
        cell.store(quantized);
        let mut image = Texture::new(Extent::new(64, 64), TextureFormat::Rgba32F);
        let overlay = render_overlay(&cell, &mut image, 1).expect("overlay");
        assert!(overlay.labels[0].text.contains("Quantized 8-bit"));
    }

    #[test]
    fn test_single_tile_mode_selects_by_index() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        let mut image = Texture::new(Extent::new(32, 32), TextureFormat::Rgba32F);
        // Level 3 + 2 selects the third enumerated tile.
        let overlay = render_overlay(&cell, &mut image, 5).expect("overlay");
        assert_eq!(overlay.labels.len(), 1);
        assert!(overlay.labels[0].text.contains("disocclusion mask"));
        // The whole image is the tile, which is all-ones here.
        assert!(image.texel(16, 16)[0] > 0.9);
    }

    #[test]
    fn test_single_tile_mode_orders_filter_columns_descending() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        let mut image = Texture::new(Extent::new(32, 32), TextureFormat::Rgba32F);
        // Level 3 + 6 selects the first kernel filter tile, column 3.
        let overlay = render_overlay(&cell, &mut image, 9).expect("overlay");
        assert!(overlay.labels[0].text.contains("kpn filter col 3"));

        cell.store(snapshot());
        // Levels 13 and 14 select feedback and theta/alpha.
        let overlay = render_overlay(&cell, &mut image, 13).expect("overlay");
        assert!(overlay.labels[0].text.contains("feedback"));
        cell.store(snapshot());
        let overlay = render_overlay(&cell, &mut image, 14).expect("overlay");
        assert!(overlay.labels[0].text.contains("theta/alpha"));
    }

    #[test]
    fn test_snapshot_consumed_by_draw() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        assert!(cell.is_valid());
        let mut image = Texture::new(Extent::new(32, 32), TextureFormat::Rgba32F);
        assert!(render_overlay(&cell, &mut image, 2).is_some());
        assert!(!cell.is_valid());
        assert!(render_overlay(&cell, &mut image, 2).is_none());
    }

    #[test]
    fn test_level_zero_leaves_snapshot_pending() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        let mut image = Texture::new(Extent::new(32, 32), TextureFormat::Rgba32F);
        assert!(render_overlay(&cell, &mut image, 0).is_none());
        assert!(cell.is_valid());
    }

    #[test]
    fn test_out_of_range_tile_index_warns_gracefully() {
        let cell = DebugSnapshotCell::default();
        cell.store(snapshot());
        let mut image = Texture::new(Extent::new(32, 32), TextureFormat::Rgba32F);
        let overlay = render_overlay(&cell, &mut image, 3 + 12).expect("overlay");
        assert!(overlay.labels.is_empty());
    }
}
