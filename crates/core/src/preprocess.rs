//! Network input packing.
//!
//! Builds the 12-channel NHWC input tensor from the padded frame surfaces
//! and the admitted history: warped previous color, jittered current color,
//! a depth-based disocclusion mask, warped feedback, and a luma derivative.

use anyhow::{bail, Result};

use crate::history::ResolvedHistory;
use crate::model::{ModelPrecision, INPUT_CHANNELS};
use crate::types::{CameraParams, Extent, Jitter, TensorBuf, Texture, TextureFormat};

/// Channel group base offsets within the packed input tensor.
pub const CH_WARPED_COLOR: usize = 0;
pub const CH_CURRENT_COLOR: usize = 3;
pub const CH_DISOCCLUSION: usize = 6;
pub const CH_WARPED_FEEDBACK: usize = 7;
pub const CH_LUMA_DERIVATIVE: usize = 11;

/// Network-calibration tunables for the disocclusion gate. The separation
/// coefficient scales the per-texel depth delta that counts as a full
/// disocclusion; the power sharpens the mask as resolution grows.
pub const DEPTH_SEPARATION_COEFF: f32 = 1.37e-05;
pub const DISOCCLUSION_POWER_MIN: f32 = 1.0;
pub const DISOCCLUSION_POWER_MAX: f32 = 3.0;

const REFERENCE_EXTENT: Extent = Extent {
    width: 1920,
    height: 1080,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisocclusionConstants {
    pub depth_separation: f32,
    pub power: f32,
}

/// Field-of-view correction factor: 1 at zero fov, growing with the
/// diagonal half-angle.
pub fn kfov(camera: &CameraParams) -> f32 {
    let tan_half = camera.tan_half_fov_diag().abs();
    1.0 / tan_half.atan().cos()
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Resolution- and fov-dependent disocclusion constants for one frame.
pub fn disocclusion_constants(camera: &CameraParams, padded: Extent) -> DisocclusionConstants {
    let depth_separation = DEPTH_SEPARATION_COEFF * kfov(camera) * padded.diagonal();
    let t = (padded.diagonal() / REFERENCE_EXTENT.diagonal()).clamp(0.0, 1.0);
    DisocclusionConstants {
        depth_separation,
        power: lerp(DISOCCLUSION_POWER_MIN, DISOCCLUSION_POWER_MAX, t),
    }
}

/// Reinhard tonemap; the network is trained on [0,1) inputs.
pub fn tonemap(value: f32) -> f32 {
    let value = value.max(0.0);
    value / (1.0 + value)
}

pub fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

/// Encodes a 3x3 neighborhood offset into a single [0,1] lane.
fn encode_offset(dx: i64, dy: i64) -> f32 {
    (((dy + 1) * 3 + (dx + 1)) as f32) / 8.0
}

pub fn decode_offset(value: f32) -> (i64, i64) {
    let index = (value * 8.0).round() as i64;
    (index % 3 - 1, index / 3 - 1)
}

pub struct PreprocessParams<'a> {
    /// Padded current-frame surfaces, all at the same tile-aligned extent.
    pub color: &'a Texture,
    pub velocity: &'a Texture,
    pub depth: &'a Texture,
    pub history: &'a ResolvedHistory,
    pub jitter: Jitter,
    pub constants: DisocclusionConstants,
    pub precision: ModelPrecision,
}

pub struct PreprocessOutputs {
    pub input_tensor: TensorBuf,
    /// Lane 0: luma derivative fed to the network. Lane 1: current luma,
    /// carried so the next frame can difference against it.
    pub luma_deriv: Texture,
    pub depth_offset: Texture,
}

pub fn run_preprocess(params: &PreprocessParams<'_>) -> Result<PreprocessOutputs> {
    let extent = params.color.desc.extent;
    if params.velocity.desc.extent != extent || params.depth.desc.extent != extent {
        bail!(
            "padded surface extents disagree: color {:?}, velocity {:?}, depth {:?}",
            params.color.desc.extent,
            params.velocity.desc.extent,
            params.depth.desc.extent
        );
    }

    let width = extent.width as usize;
    let height = extent.height as usize;
    let mut tensor = TensorBuf::zeroed(
        params.precision.input_dtype(),
        [1, height, width, INPUT_CHANNELS],
    );
    let mut luma_deriv = Texture::new(extent, TextureFormat::Rg32F);
    let mut depth_offset = Texture::new(extent, TextureFormat::R32F);

    let history = params.history;
    let cut = history.treat_as_camera_cut;
    let prev_color = history.upscaled_color.as_ref();
    let scale_x = prev_color.desc.extent.width as f32 / extent.width as f32;
    let scale_y = prev_color.desc.extent.height as f32 / extent.height as f32;

    for y in 0..height {
        for x in 0..width {
            let (xi, yi) = (x as i64, y as i64);

            // Closest-depth offset: the 3x3 neighbor nearest the camera
            // carries the most reliable motion vector for this texel.
            let mut best = (0i64, 0i64);
            let mut best_depth = f32::INFINITY;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let depth = params.depth.load(xi + dx, yi + dy, 0);
                    if depth < best_depth {
                        best_depth = depth;
                        best = (dx, dy);
                    }
                }
            }
            depth_offset.texel_mut(x as u32, y as u32)[0] = encode_offset(best.0, best.1);

            let vx = params.velocity.load(xi + best.0, yi + best.1, 0);
            let vy = params.velocity.load(xi + best.0, yi + best.1, 1);
            let px = xi as f32 - vx;
            let py = yi as f32 - vy;
            let pxi = px.round() as i64;
            let pyi = py.round() as i64;

            // Warped previous upscaled color, downsampled back to input
            // resolution and tonemapped.
            for c in 0..3 {
                let value = prev_color.load(
                    (px * scale_x).round() as i64,
                    (py * scale_y).round() as i64,
                    c,
                );
                tensor.set(y, x, CH_WARPED_COLOR + c, tonemap(value));
            }

            // Jittered, tonemapped current color.
            let jx = (xi as f32 - params.jitter.x).round() as i64;
            let jy = (yi as f32 - params.jitter.y).round() as i64;
            let r = tonemap(params.color.load(jx, jy, 0));
            let g = tonemap(params.color.load(jx, jy, 1));
            let b = tonemap(params.color.load(jx, jy, 2));
            tensor.set(y, x, CH_CURRENT_COLOR, r);
            tensor.set(y, x, CH_CURRENT_COLOR + 1, g);
            tensor.set(y, x, CH_CURRENT_COLOR + 2, b);

            // Disocclusion mask: depth separation between the reprojected
            // previous depth and the current depth, gated and sharpened. A
            // camera cut disoccludes everything.
            let mask = if cut {
                1.0
            } else {
                let current_depth = params.depth.load(xi, yi, 0);
                let previous_depth = history.depth.load(pxi, pyi, 0);
                let separation = (previous_depth - current_depth)
                    / params.constants.depth_separation.max(f32::EPSILON);
                separation.clamp(0.0, 1.0).powf(params.constants.power)
            };
            tensor.set(y, x, CH_DISOCCLUSION, mask);

            // Warped feedback: the network's own recurrent state, fetched
            // along the same reprojection.
            for c in 0..4 {
                let value = if cut {
                    0.0
                } else {
                    history.feedback.get(pyi, pxi, c)
                };
                tensor.set(y, x, CH_WARPED_FEEDBACK + c, value);
            }

            // Luma derivative against the previous frame's stored luma.
            let current_luma = luma(r, g, b);
            let previous_luma = history.luma_deriv.load(xi, yi, 1);
            let derivative = if cut {
                0.0
            } else {
                (current_luma - previous_luma).abs()
            };
            tensor.set(y, x, CH_LUMA_DERIVATIVE, derivative);
            luma_deriv.texel_mut(x as u32, y as u32)[0] = derivative;
            luma_deriv.texel_mut(x as u32, y as u32)[1] = current_luma;
        }
    }

    Ok(PreprocessOutputs {
        input_tensor: tensor,
        luma_deriv,
        depth_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{resolve_history, HistoryLayout, TemporalHistory};
    use crate::types::{TextureView, ViewRect};
    use std::sync::Arc;

    fn absent_history(extent: Extent, precision: ModelPrecision) -> ResolvedHistory {
        let layout = HistoryLayout {
            upscaled_extent: Extent::new(extent.width * 2, extent.height * 2),
            depth_rect: ViewRect::at_origin(extent),
            aux_extent: extent,
            feedback_bytes: extent.texel_count()
                * 4
                * precision.output_dtype().element_size(),
        };
        let depth = TextureView::full(Arc::new(Texture::new(extent, TextureFormat::Depth32F)));
        resolve_history(
            &TemporalHistory::Absent,
            &layout,
            false,
            true,
            &depth,
            precision,
        )
    }

    fn run_on_flat_color(precision: ModelPrecision) -> TensorBuf {
        let extent = Extent::new(8, 8);
        let color = Texture::filled(extent, TextureFormat::Rgba32F, &[1.0, 1.0, 1.0, 1.0]);
        let velocity = Texture::new(extent, TextureFormat::Rg32F);
        let depth = Texture::new(extent, TextureFormat::Depth32F);
        let history = absent_history(extent, precision);
        let camera = CameraParams {
            tan_half_fov_x: 1.0,
            tan_half_fov_y: 0.6,
        };
        let outputs = run_preprocess(&PreprocessParams {
            color: &color,
            velocity: &velocity,
            depth: &depth,
            history: &history,
            jitter: Jitter::default(),
            constants: disocclusion_constants(&camera, extent),
            precision,
        })
        .expect("preprocess");
        outputs.input_tensor
    }

    #[test]
    fn test_kfov_identity_at_zero_fov() {
        let camera = CameraParams {
            tan_half_fov_x: 0.0,
            tan_half_fov_y: 0.0,
        };
        assert_eq!(kfov(&camera), 1.0);
    }

    #[test]
    fn test_kfov_grows_with_fov() {
        let narrow = CameraParams {
            tan_half_fov_x: 0.3,
            tan_half_fov_y: 0.2,
        };
        let wide = CameraParams {
            tan_half_fov_x: 1.0,
            tan_half_fov_y: 0.8,
        };
        assert!(kfov(&wide) > kfov(&narrow));
        assert!(kfov(&narrow) > 1.0);
    }

    #[test]
    fn test_disocclusion_power_saturates_at_reference_diagonal() {
        let camera = CameraParams {
            tan_half_fov_x: 1.0,
            tan_half_fov_y: 0.6,
        };
        let small = disocclusion_constants(&camera, Extent::new(480, 270));
        let reference = disocclusion_constants(&camera, Extent::new(1920, 1080));
        let huge = disocclusion_constants(&camera, Extent::new(3840, 2160));
        assert!(small.power > DISOCCLUSION_POWER_MIN);
        assert!(small.power < DISOCCLUSION_POWER_MAX);
        assert_eq!(reference.power, DISOCCLUSION_POWER_MAX);
        assert_eq!(huge.power, DISOCCLUSION_POWER_MAX);
    }

    #[test]
    fn test_offset_encoding_roundtrip() {
        for dy in -1..=1 {
            for dx in -1..=1 {
                let encoded = encode_offset(dx, dy);
                assert!((0.0..=1.0).contains(&encoded));
                assert_eq!(decode_offset(encoded), (dx, dy));
            }
        }
    }

    #[test]
    fn test_channel_groups_on_absent_history() {
        for precision in [ModelPrecision::Float32, ModelPrecision::Quantized8] {
            let tensor = run_on_flat_color(precision);
            assert_eq!(tensor.shape, [1, 8, 8, INPUT_CHANNELS]);

            let tolerance = match precision {
                ModelPrecision::Float32 => 1e-6,
                ModelPrecision::Quantized8 => 1.0 / 255.0,
            };
            // Warped previous color is black: absent history resolves to a
            // black placeholder.
            assert!(tensor.get(4, 4, CH_WARPED_COLOR).abs() <= tolerance);
            // Current color 1.0 tonemaps to 0.5.
            for c in 0..3 {
                assert!((tensor.get(4, 4, CH_CURRENT_COLOR + c) - 0.5).abs() <= tolerance);
            }
            // Absent history is a cut, which disoccludes everything and
            // zeroes feedback and the luma derivative.
            assert!((tensor.get(4, 4, CH_DISOCCLUSION) - 1.0).abs() <= tolerance);
            for c in 0..4 {
                assert!(tensor.get(4, 4, CH_WARPED_FEEDBACK + c).abs() <= tolerance);
            }
            assert!(tensor.get(4, 4, CH_LUMA_DERIVATIVE).abs() <= tolerance);
        }
    }

    #[test]
    fn test_depth_offset_picks_closest_neighbor() {
        let extent = Extent::new(8, 8);
        let color = Texture::new(extent, TextureFormat::Rgba32F);
        let velocity = Texture::new(extent, TextureFormat::Rg32F);
        let mut depth = Texture::filled(extent, TextureFormat::Depth32F, &[1.0]);
        // The texel up-left of (4,4) is nearest the camera.
        depth.texel_mut(3, 3)[0] = 0.1;
        let history = absent_history(extent, ModelPrecision::Float32);
        let camera = CameraParams {
            tan_half_fov_x: 1.0,
            tan_half_fov_y: 0.6,
        };
        let outputs = run_preprocess(&PreprocessParams {
            color: &color,
            velocity: &velocity,
            depth: &depth,
            history: &history,
            jitter: Jitter::default(),
            constants: disocclusion_constants(&camera, extent),
            precision: ModelPrecision::Float32,
        })
        .expect("preprocess");

        let encoded = outputs.depth_offset.texel(4, 4)[0];
        assert_eq!(decode_offset(encoded), (-1, -1));
        // The closest texel itself reports a zero offset.
        assert_eq!(decode_offset(outputs.depth_offset.texel(3, 3)[0]), (0, 0));
    }

    #[test]
    fn test_mismatched_surface_extents_rejected() {
        let color = Texture::new(Extent::new(8, 8), TextureFormat::Rgba32F);
        let velocity = Texture::new(Extent::new(16, 8), TextureFormat::Rg32F);
        let depth = Texture::new(Extent::new(8, 8), TextureFormat::Depth32F);
        let history = absent_history(Extent::new(8, 8), ModelPrecision::Float32);
        let camera = CameraParams {
            tan_half_fov_x: 1.0,
            tan_half_fov_y: 0.6,
        };
        let result = run_preprocess(&PreprocessParams {
            color: &color,
            velocity: &velocity,
            depth: &depth,
            history: &history,
            jitter: Jitter::default(),
            constants: disocclusion_constants(&camera, Extent::new(8, 8)),
            precision: ModelPrecision::Float32,
        });
        assert!(result.is_err());
    }
}
