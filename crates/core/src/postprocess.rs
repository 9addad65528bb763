//! Output reconstruction.
//!
//! Applies the network's per-pixel 4x4 kernel-prediction filter to the
//! padded input color, blends against the warped previous output, and
//! refreshes the stored luma plane from the reconstructed frame. Dispatch is
//! tiled 8x8 to mirror the compute-group layout the kernels assume.

use anyhow::{bail, Result};

use crate::preprocess::{luma, tonemap};
use crate::types::{Extent, Jitter, TensorBuf, Texture, TextureFormat};

pub const GROUP_SIZE: u32 = 8;

/// Taps per axis of the predicted reconstruction kernel.
pub const KPN_TAPS: usize = 4;

fn inverse_tonemap(value: f32) -> f32 {
    let value = value.clamp(0.0, 0.9999);
    value / (1.0 - value)
}

pub struct PostprocessParams<'a> {
    /// Blend weight (lane 3) and filter steering from the network.
    pub theta_alpha: &'a TensorBuf,
    /// Four filter-column tensors; column `i`, lane `j` is the weight of
    /// tap (row `j`, column `i`).
    pub filters: [&'a TensorBuf; 4],
    /// Padded current-frame color at input resolution.
    pub color: &'a Texture,
    /// Previous padded output, or a black placeholder on a cut.
    pub prev_upscaled: &'a Texture,
    pub jitter: Jitter,
    /// Forces the blend weight to zero so no stale history leaks through.
    pub treat_as_camera_cut: bool,
    pub padded_output: Extent,
}

/// Reconstructs the padded output frame and rewrites `luma_deriv` lane 1
/// with the output-derived luma at input resolution.
pub fn run_postprocess(
    params: &PostprocessParams<'_>,
    luma_deriv: &mut Texture,
) -> Result<Texture> {
    let input = params.color.desc.extent;
    let expected = [
        1,
        input.height as usize,
        input.width as usize,
        KPN_TAPS,
    ];
    if params.theta_alpha.shape != expected {
        bail!(
            "theta/alpha tensor shape {:?} does not match input surface {expected:?}",
            params.theta_alpha.shape
        );
    }
    for filter in &params.filters {
        if filter.shape != expected {
            bail!(
                "filter tensor shape {:?} does not match input surface {expected:?}",
                filter.shape
            );
        }
    }

    let output = params.padded_output;
    let mut reconstructed = Texture::new(output, TextureFormat::Rgba32F);
    let scale_x = input.width as f32 / output.width as f32;
    let scale_y = input.height as f32 / output.height as f32;

    let tiles_x = output.width.div_ceil(GROUP_SIZE);
    let tiles_y = output.height.div_ceil(GROUP_SIZE);
    for tile_y in 0..tiles_y {
        for tile_x in 0..tiles_x {
            for local_y in 0..GROUP_SIZE {
                for local_x in 0..GROUP_SIZE {
                    let ox = tile_x * GROUP_SIZE + local_x;
                    let oy = tile_y * GROUP_SIZE + local_y;
                    if ox >= output.width || oy >= output.height {
                        continue;
                    }
                    let texel =
                        reconstruct_texel(params, ox, oy, scale_x, scale_y);
                    reconstructed
                        .texel_mut(ox, oy)
                        .copy_from_slice(&texel);
                }
            }
        }
    }

    // Refresh the stored luma plane from the reconstructed output so the
    // next frame differences against what was actually displayed.
    let out_scale_x = output.width as f32 / input.width as f32;
    let out_scale_y = output.height as f32 / input.height as f32;
    for y in 0..input.height {
        for x in 0..input.width {
            let sx = ((x as f32 + 0.5) * out_scale_x - 0.5).round() as i64;
            let sy = ((y as f32 + 0.5) * out_scale_y - 0.5).round() as i64;
            let r = tonemap(reconstructed.load(sx, sy, 0));
            let g = tonemap(reconstructed.load(sx, sy, 1));
            let b = tonemap(reconstructed.load(sx, sy, 2));
            luma_deriv.texel_mut(x, y)[1] = luma(r, g, b);
        }
    }

    Ok(reconstructed)
}

fn reconstruct_texel(
    params: &PostprocessParams<'_>,
    ox: u32,
    oy: u32,
    scale_x: f32,
    scale_y: f32,
) -> [f32; 4] {
    // Map the output texel back into the jittered input frame.
    let sx_f = (ox as f32 + 0.5) * scale_x - 0.5 - params.jitter.x;
    let sy_f = (oy as f32 + 0.5) * scale_y - 0.5 - params.jitter.y;
    let sx = sx_f.round() as i64;
    let sy = sy_f.round() as i64;
    let base_x = sx_f.floor() as i64 - 1;
    let base_y = sy_f.floor() as i64 - 1;

    // Gather the 4x4 window in tonemapped space with the predicted weights.
    let mut accum = [0.0f32; 3];
    let mut weight_sum = 0.0f32;
    for row in 0..KPN_TAPS {
        for col in 0..KPN_TAPS {
            let weight = params.filters[col].get(sy, sx, row);
            let tap_x = base_x + col as i64;
            let tap_y = base_y + row as i64;
            for (c, lane) in accum.iter_mut().enumerate() {
                *lane += weight * tonemap(params.color.load(tap_x, tap_y, c));
            }
            weight_sum += weight;
        }
    }

    let filtered = if weight_sum.abs() <= f32::EPSILON {
        // Degenerate kernel: fall back to the nearest input texel.
        [
            tonemap(params.color.load(sx, sy, 0)),
            tonemap(params.color.load(sx, sy, 1)),
            tonemap(params.color.load(sx, sy, 2)),
        ]
    } else {
        [
            accum[0] / weight_sum,
            accum[1] / weight_sum,
            accum[2] / weight_sum,
        ]
    };

    let alpha = if params.treat_as_camera_cut {
        0.0
    } else {
        params.theta_alpha.get(sy, sx, 3).clamp(0.0, 1.0)
    };

    let mut texel = [0.0f32; 4];
    for c in 0..3 {
        let prev = tonemap(params.prev_upscaled.load(ox as i64, oy as i64, c));
        let blended = prev * alpha + filtered[c] * (1.0 - alpha);
        texel[c] = inverse_tonemap(blended);
    }
    texel[3] = 1.0;
    texel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorDtype;

    fn uniform_tensor(extent: Extent, value: f32) -> TensorBuf {
        let mut tensor = TensorBuf::zeroed(
            TensorDtype::F32,
            [1, extent.height as usize, extent.width as usize, KPN_TAPS],
        );
        for y in 0..extent.height as usize {
            for x in 0..extent.width as usize {
                for c in 0..KPN_TAPS {
                    tensor.set(y, x, c, value);
                }
            }
        }
        tensor
    }

    fn run(
        input: Extent,
        output: Extent,
        color_value: f32,
        prev_value: f32,
        alpha: f32,
        cut: bool,
    ) -> Texture {
        let color = Texture::filled(
            input,
            TextureFormat::Rgba32F,
            &[color_value, color_value, color_value, 1.0],
        );
        let prev = Texture::filled(
            output,
            TextureFormat::Rgba32F,
            &[prev_value, prev_value, prev_value, 1.0],
        );
        let filters = uniform_tensor(input, 1.0 / 16.0);
        let theta_alpha = uniform_tensor(input, alpha);
        let mut luma_deriv = Texture::new(input, TextureFormat::Rg32F);
        run_postprocess(
            &PostprocessParams {
                theta_alpha: &theta_alpha,
                filters: [&filters, &filters, &filters, &filters],
                color: &color,
                prev_upscaled: &prev,
                jitter: Jitter::default(),
                treat_as_camera_cut: cut,
                padded_output: output,
            },
            &mut luma_deriv,
        )
        .expect("postprocess")
    }

    #[test]
    fn test_uniform_kernel_preserves_flat_color() {
        let output = run(
            Extent::new(16, 8),
            Extent::new(32, 16),
            1.0,
            0.0,
            0.0,
            false,
        );
        assert_eq!(output.desc.extent, Extent::new(32, 16));
        for &value in output.texel(10, 10) {
            assert!((value - 1.0).abs() < 1e-3 || value == 1.0);
        }
    }

    #[test]
    fn test_full_alpha_keeps_previous_frame() {
        let output = run(
            Extent::new(16, 8),
            Extent::new(32, 16),
            1.0,
            3.0,
            1.0,
            false,
        );
        assert!((output.texel(5, 5)[0] - 3.0).abs() < 1e-2);
    }

    #[test]
    fn test_camera_cut_disables_blend() {
        // Same inputs as above, but the cut forces alpha to zero: the
        // previous frame's value must not leak through.
        let output = run(
            Extent::new(16, 8),
            Extent::new(32, 16),
            1.0,
            3.0,
            1.0,
            true,
        );
        assert!((output.texel(5, 5)[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_zero_weight_kernel_falls_back_without_nan() {
        let input = Extent::new(8, 8);
        let output = Extent::new(16, 16);
        let color = Texture::filled(input, TextureFormat::Rgba32F, &[2.0, 2.0, 2.0, 1.0]);
        let prev = Texture::new(output, TextureFormat::Rgba32F);
        let zero = uniform_tensor(input, 0.0);
        let mut luma_deriv = Texture::new(input, TextureFormat::Rg32F);
        let reconstructed = run_postprocess(
            &PostprocessParams {
                theta_alpha: &zero,
                filters: [&zero, &zero, &zero, &zero],
                color: &color,
                prev_upscaled: &prev,
                jitter: Jitter::default(),
                treat_as_camera_cut: false,
                padded_output: output,
            },
            &mut luma_deriv,
        )
        .expect("postprocess");
        for texel in reconstructed.texels {
            assert!(texel.is_finite());
        }
    }

    #[test]
    fn test_luma_plane_refreshed_from_output() {
        let input = Extent::new(8, 8);
        let mut luma_deriv = Texture::new(input, TextureFormat::Rg32F);
        let color = Texture::filled(input, TextureFormat::Rgba32F, &[1.0, 1.0, 1.0, 1.0]);
        let prev = Texture::new(Extent::new(16, 16), TextureFormat::Rgba32F);
        let filters = uniform_tensor(input, 1.0 / 16.0);
        let theta_alpha = uniform_tensor(input, 0.0);
        run_postprocess(
            &PostprocessParams {
                theta_alpha: &theta_alpha,
                filters: [&filters, &filters, &filters, &filters],
                color: &color,
                prev_upscaled: &prev,
                jitter: Jitter::default(),
                treat_as_camera_cut: false,
                padded_output: Extent::new(16, 16),
            },
            &mut luma_deriv,
        )
        .expect("postprocess");
        // Flat white reconstructs to ~1.0, tonemapped to ~0.5, luma ~0.5.
        assert!((luma_deriv.texel(4, 4)[1] - 0.5).abs() < 1e-2);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let input = Extent::new(8, 8);
        let color = Texture::new(input, TextureFormat::Rgba32F);
        let prev = Texture::new(Extent::new(16, 16), TextureFormat::Rgba32F);
        let wrong = uniform_tensor(Extent::new(16, 8), 0.0);
        let ok = uniform_tensor(input, 0.0);
        let mut luma_deriv = Texture::new(input, TextureFormat::Rg32F);
        let result = run_postprocess(
            &PostprocessParams {
                theta_alpha: &wrong,
                filters: [&ok, &ok, &ok, &ok],
                color: &color,
                prev_upscaled: &prev,
                jitter: Jitter::default(),
                treat_as_camera_cut: false,
                padded_output: Extent::new(16, 16),
            },
            &mut luma_deriv,
        );
        assert!(result.is_err());
    }
}
