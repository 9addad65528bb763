//! Per-view temporal history.
//!
//! One record is carried from frame to frame. It is either absent or valid;
//! a valid record whose surfaces no longer match the current frame's sizes
//! is discarded and the frame is treated as a camera cut.

use std::sync::Arc;

use tracing::debug;

use crate::model::ModelPrecision;
use crate::types::{Extent, Jitter, TensorBuf, Texture, TextureFormat, TextureView, ViewRect};

/// Everything the next frame needs from this one.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    /// Reconstructed color at the padded output extent.
    pub upscaled_color: Arc<Texture>,
    /// Padded depth; the rect marks the unpadded valid region.
    pub depth: TextureView,
    /// Two lanes per texel: luma derivative and tonemapped luma.
    pub luma_deriv: Arc<Texture>,
    /// Encoded closest-depth offsets from the preprocess stage.
    pub depth_offset: Arc<Texture>,
    /// Raw network feedback tensor, re-warped into next frame's input.
    pub feedback: TensorBuf,
    pub jitter: Jitter,
}

/// Surface sizes the current frame computed. A stored record must match
/// exactly to be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLayout {
    pub upscaled_extent: Extent,
    pub depth_rect: ViewRect,
    pub aux_extent: Extent,
    pub feedback_bytes: usize,
}

impl HistoryRecord {
    pub fn matches(&self, layout: &HistoryLayout) -> bool {
        self.upscaled_color.desc.extent == layout.upscaled_extent
            && self.depth.rect == layout.depth_rect
            && self.luma_deriv.desc.extent == layout.aux_extent
            && self.depth_offset.desc.extent == layout.aux_extent
            && self.feedback.byte_len() == layout.feedback_bytes
    }
}

#[derive(Debug, Clone, Default)]
pub enum TemporalHistory {
    #[default]
    Absent,
    Valid(HistoryRecord),
}

impl TemporalHistory {
    pub fn is_valid(&self) -> bool {
        matches!(self, TemporalHistory::Valid(_))
    }

    /// Decides whether the stored record may feed the current frame.
    ///
    /// Returns the admitted record and the effective camera-cut flag: any
    /// reason history cannot be used (renderer-declared cut, absent record,
    /// size mismatch, history disabled) is treated as a cut.
    pub fn admit(
        &self,
        layout: &HistoryLayout,
        camera_cut: bool,
        history_enabled: bool,
    ) -> (Option<&HistoryRecord>, bool) {
        if !history_enabled {
            debug!("temporal history disabled for this frame");
            return (None, true);
        }
        if camera_cut {
            return (None, true);
        }
        let TemporalHistory::Valid(record) = self else {
            return (None, true);
        };
        if !record.matches(layout) {
            debug!(
                stored_width = record.upscaled_color.desc.extent.width,
                stored_height = record.upscaled_color.desc.extent.height,
                expected_width = layout.upscaled_extent.width,
                expected_height = layout.upscaled_extent.height,
                "history surfaces no longer match, treating frame as camera cut"
            );
            return (None, true);
        }
        (Some(record), false)
    }
}

/// History artifacts with placeholders substituted when no record was
/// admitted, so downstream kernels never branch on presence.
#[derive(Debug, Clone)]
pub struct ResolvedHistory {
    pub upscaled_color: Arc<Texture>,
    pub depth: TextureView,
    pub luma_deriv: Arc<Texture>,
    pub depth_offset: Arc<Texture>,
    pub feedback: TensorBuf,
    pub jitter: Jitter,
    pub treat_as_camera_cut: bool,
}

/// Admits `history` against `layout` and fills in neutral placeholders
/// (black color, zero feedback, current depth) when it is rejected.
pub fn resolve_history(
    history: &TemporalHistory,
    layout: &HistoryLayout,
    camera_cut: bool,
    history_enabled: bool,
    current_depth: &TextureView,
    precision: ModelPrecision,
) -> ResolvedHistory {
    let (record, treat_as_camera_cut) = history.admit(layout, camera_cut, history_enabled);
    match record {
        Some(record) => ResolvedHistory {
            upscaled_color: Arc::clone(&record.upscaled_color),
            depth: record.depth.clone(),
            luma_deriv: Arc::clone(&record.luma_deriv),
            depth_offset: Arc::clone(&record.depth_offset),
            feedback: record.feedback.clone(),
            jitter: record.jitter,
            treat_as_camera_cut,
        },
        None => ResolvedHistory {
            upscaled_color: Arc::new(Texture::new(
                layout.upscaled_extent,
                TextureFormat::Rgba32F,
            )),
            depth: current_depth.clone(),
            luma_deriv: Arc::new(Texture::new(layout.aux_extent, TextureFormat::Rg32F)),
            depth_offset: Arc::new(Texture::new(layout.aux_extent, TextureFormat::R32F)),
            feedback: TensorBuf::zeroed(
                precision.output_dtype(),
                [1, layout.aux_extent.height as usize, layout.aux_extent.width as usize, 4],
            ),
            jitter: Jitter::default(),
            treat_as_camera_cut,
        },
    }
}
