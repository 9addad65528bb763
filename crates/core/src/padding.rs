//! Multiple-of-8 padding for network-facing surfaces.
//!
//! The network consumes tiles of 8x8 texels, so every surface it sees is
//! mirror-padded on the bottom and right edges up to the next multiple of 8.
//! The left and top edges are never moved; valid data always starts at the
//! origin and crops are origin-anchored.

use std::sync::Arc;

use crate::types::{Extent, Texture, TextureFormat, TextureView};

pub const TILE_ALIGN: u32 = 8;

fn align_up(value: u32) -> u32 {
    value.div_ceil(TILE_ALIGN) * TILE_ALIGN
}

pub fn padded_extent(extent: Extent) -> Extent {
    Extent::new(align_up(extent.width), align_up(extent.height))
}

/// Bottom/right padding in texels for `extent`, as `(pad_x, pad_y)`.
pub fn padding_amount(extent: Extent) -> (u32, u32) {
    let padded = padded_extent(extent);
    (padded.width - extent.width, padded.height - extent.height)
}

/// Output-side padding proportional to the input-side padding, rounded up:
/// `ceil(pad_in * out / in)` per axis. Keeps the padded output covering at
/// least the scaled image of the padded input region.
pub fn output_padding(input_pad: (u32, u32), input: Extent, output: Extent) -> (u32, u32) {
    let scale = |pad: u32, out: u32, inp: u32| -> u32 {
        if inp == 0 {
            return 0;
        }
        ((pad as u64 * out as u64).div_ceil(inp as u64)) as u32
    };
    (
        scale(input_pad.0, output.width, input.width),
        scale(input_pad.1, output.height, input.height),
    )
}

/// Padded extent of the upscaled output for a given input/output pair.
pub fn padded_output_extent(input: Extent, output: Extent) -> Extent {
    let (pad_x, pad_y) = output_padding(padding_amount(input), input, output);
    Extent::new(output.width + pad_x, output.height + pad_y)
}

fn mirror_coord(v: u32, size: u32) -> u32 {
    if v < size {
        return v;
    }
    // Reflect off the last valid texel; clamps when the pad would overshoot
    // a degenerate (tiny) axis.
    let back = (v - size + 1).min(size - 1);
    size - 1 - back
}

/// Produces a tile-aligned texture holding `view`'s valid region with the
/// bottom/right edges mirror-extended, converted to `format`.
///
/// When the view already covers a whole, aligned texture of the requested
/// format, the underlying allocation is returned as-is (no copy).
pub fn pad_to_tile(view: &TextureView, format: TextureFormat) -> Arc<Texture> {
    let valid = view.extent();
    let target = padded_extent(valid);

    let whole_texture = view.rect.x == 0
        && view.rect.y == 0
        && view.texture.desc.extent == valid
        && view.texture.desc.format == format;
    if whole_texture && target == valid {
        return Arc::clone(&view.texture);
    }

    let channels = format.channels();
    let mut padded = Texture::new(target, format);
    for y in 0..target.height {
        let sy = mirror_coord(y, valid.height);
        for x in 0..target.width {
            let sx = mirror_coord(x, valid.width);
            let src = view
                .texture
                .texel(view.rect.x + sx, view.rect.y + sy);
            padded.texel_mut(x, y)[..channels].copy_from_slice(&src[..channels]);
        }
    }
    Arc::new(padded)
}
