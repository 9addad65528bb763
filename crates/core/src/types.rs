use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Texture size in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn diagonal(&self) -> f32 {
        let w = self.width as f32;
        let h = self.height as f32;
        (w * w + h * h).sqrt()
    }
}

/// Sub-rectangle of a texture holding valid data. Origin is the top-left texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ViewRect {
    pub fn at_origin(extent: Extent) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

/// Texel formats the pipeline traffics in. All formats are stored as f32
/// lanes on the CPU; the format records channel count and depth semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba32F,
    Rg32F,
    R32F,
    Depth32F,
}

impl TextureFormat {
    pub fn channels(&self) -> usize {
        match self {
            TextureFormat::Rgba32F => 4,
            TextureFormat::Rg32F => 2,
            TextureFormat::R32F | TextureFormat::Depth32F => 1,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32F)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: Extent,
    pub format: TextureFormat,
}

/// CPU texel store standing in for a GPU texture. Row-major, tightly packed,
/// `format.channels()` f32 lanes per texel.
#[derive(Debug, Clone, PartialEq)]
pub struct Texture {
    pub desc: TextureDesc,
    pub texels: Vec<f32>,
}

impl Texture {
    pub fn new(extent: Extent, format: TextureFormat) -> Self {
        let desc = TextureDesc { extent, format };
        let texels = vec![0.0; extent.texel_count() * format.channels()];
        Self { desc, texels }
    }

    /// Allocates a texture with every texel set to `fill` (one value per channel).
    pub fn filled(extent: Extent, format: TextureFormat, fill: &[f32]) -> Self {
        let mut texture = Self::new(extent, format);
        let channels = format.channels();
        for texel in texture.texels.chunks_exact_mut(channels) {
            texel.copy_from_slice(&fill[..channels]);
        }
        texture
    }

    pub fn channels(&self) -> usize {
        self.desc.format.channels()
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.desc.extent.width as usize + x as usize) * self.channels()
    }

    pub fn texel(&self, x: u32, y: u32) -> &[f32] {
        let channels = self.channels();
        let index = self.index(x, y);
        &self.texels[index..index + channels]
    }

    pub fn texel_mut(&mut self, x: u32, y: u32) -> &mut [f32] {
        let channels = self.channels();
        let index = self.index(x, y);
        &mut self.texels[index..index + channels]
    }

    /// Single-channel fetch with clamp-to-edge addressing.
    pub fn load(&self, x: i64, y: i64, channel: usize) -> f32 {
        let cx = x.clamp(0, self.desc.extent.width as i64 - 1) as u32;
        let cy = y.clamp(0, self.desc.extent.height as i64 - 1) as u32;
        self.texel(cx, cy)[channel]
    }
}

/// Shared texture plus the rectangle of it that holds valid data.
#[derive(Debug, Clone)]
pub struct TextureView {
    pub texture: Arc<Texture>,
    pub rect: ViewRect,
}

impl TextureView {
    /// View covering the whole texture.
    pub fn full(texture: Arc<Texture>) -> Self {
        let rect = ViewRect::at_origin(texture.desc.extent);
        Self { texture, rect }
    }

    pub fn extent(&self) -> Extent {
        self.rect.extent()
    }

    /// Single-channel fetch in view-local coordinates, clamped to the view rect.
    pub fn load(&self, x: i64, y: i64, channel: usize) -> f32 {
        let cx = x.clamp(0, self.rect.width as i64 - 1) as u32 + self.rect.x;
        let cy = y.clamp(0, self.rect.height as i64 - 1) as u32 + self.rect.y;
        self.texture.texel(cx, cy)[channel]
    }
}

/// Sub-texel camera jitter applied to the current frame, in input texels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Jitter {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub tan_half_fov_x: f32,
    pub tan_half_fov_y: f32,
}

impl CameraParams {
    pub fn tan_half_fov_diag(&self) -> f32 {
        (self.tan_half_fov_x * self.tan_half_fov_x + self.tan_half_fov_y * self.tan_half_fov_y)
            .sqrt()
    }
}

/// Everything one upscale invocation consumes from the renderer.
#[derive(Debug, Clone)]
pub struct FrameInputs {
    pub scene_color: TextureView,
    pub scene_velocity: TextureView,
    pub scene_depth: TextureView,
    /// Target output rectangle; its extent is the upscaled resolution.
    pub output_rect: ViewRect,
    pub jitter: Jitter,
    pub camera_cut: bool,
    pub camera: CameraParams,
}

/// Tensor element type. Quantized networks traffic in u8, float networks in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDtype {
    U8,
    F32,
}

impl TensorDtype {
    pub fn element_size(&self) -> usize {
        match self {
            TensorDtype::U8 => 1,
            TensorDtype::F32 => 4,
        }
    }
}

/// Flat NHWC tensor buffer. Element access goes through `get`/`set`, which
/// quantize and dequantize transparently for u8 buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuf {
    pub dtype: TensorDtype,
    pub shape: [usize; 4],
    pub data: Vec<u8>,
}

impl TensorBuf {
    pub fn zeroed(dtype: TensorDtype, shape: [usize; 4]) -> Self {
        let elements: usize = shape.iter().product();
        Self {
            dtype,
            shape,
            data: vec![0; elements * dtype.element_size()],
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn offset(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.shape[2] + x) * self.shape[3] + c
    }

    pub fn read(&self, index: usize) -> f32 {
        match self.dtype {
            TensorDtype::U8 => self.data[index] as f32 / 255.0,
            TensorDtype::F32 => {
                let base = index * 4;
                f32::from_le_bytes([
                    self.data[base],
                    self.data[base + 1],
                    self.data[base + 2],
                    self.data[base + 3],
                ])
            }
        }
    }

    pub fn write(&mut self, index: usize, value: f32) {
        match self.dtype {
            TensorDtype::U8 => {
                self.data[index] = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            TensorDtype::F32 => {
                self.data[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// NHWC fetch for batch 0, clamped to the tensor footprint.
    pub fn get(&self, y: i64, x: i64, c: usize) -> f32 {
        let cy = y.clamp(0, self.shape[1] as i64 - 1) as usize;
        let cx = x.clamp(0, self.shape[2] as i64 - 1) as usize;
        self.read(self.offset(cy, cx, c))
    }

    pub fn set(&mut self, y: usize, x: usize, c: usize, value: f32) {
        let index = self.offset(y, x, c);
        self.write(index, value);
    }

    /// Reinterprets an f32 buffer as a contiguous f32 vector.
    pub fn as_f32_vec(&self) -> Vec<f32> {
        debug_assert_eq!(self.dtype, TensorDtype::F32);
        self.data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    pub fn copy_from_f32(&mut self, values: &[f32]) {
        debug_assert_eq!(self.dtype, TensorDtype::F32);
        debug_assert_eq!(values.len(), self.element_count());
        for (chunk, value) in self.data.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn copy_from_u8(&mut self, values: &[u8]) {
        debug_assert_eq!(self.dtype, TensorDtype::U8);
        self.data.copy_from_slice(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_diagonal() {
        let extent = Extent::new(3, 4);
        assert_eq!(extent.diagonal(), 5.0);
        assert_eq!(extent.texel_count(), 12);
    }

    #[test]
    fn test_texture_texel_access() {
        let mut texture = Texture::new(Extent::new(4, 2), TextureFormat::Rg32F);
        texture.texel_mut(3, 1).copy_from_slice(&[0.25, 0.75]);
        assert_eq!(texture.texel(3, 1), &[0.25, 0.75]);
        assert_eq!(texture.texel(0, 0), &[0.0, 0.0]);
    }

    #[test]
    fn test_texture_load_clamps_to_edge() {
        let mut texture = Texture::new(Extent::new(2, 2), TextureFormat::R32F);
        texture.texel_mut(1, 1)[0] = 9.0;
        assert_eq!(texture.load(5, 5, 0), 9.0);
        assert_eq!(texture.load(-3, -3, 0), texture.texel(0, 0)[0]);
    }

    #[test]
    fn test_view_load_respects_rect() {
        let mut texture = Texture::new(Extent::new(4, 4), TextureFormat::R32F);
        texture.texel_mut(1, 1)[0] = 1.0;
        texture.texel_mut(2, 2)[0] = 2.0;
        let view = TextureView {
            texture: Arc::new(texture),
            rect: ViewRect {
                x: 1,
                y: 1,
                width: 2,
                height: 2,
            },
        };
        assert_eq!(view.load(0, 0, 0), 1.0);
        assert_eq!(view.load(1, 1, 0), 2.0);
        // Clamp keeps reads inside the view rect, not just the texture.
        assert_eq!(view.load(10, 10, 0), 2.0);
    }

    #[test]
    fn test_tensor_f32_roundtrip() {
        let mut tensor = TensorBuf::zeroed(TensorDtype::F32, [1, 2, 2, 3]);
        tensor.set(1, 0, 2, -1.5);
        assert_eq!(tensor.get(1, 0, 2), -1.5);
        assert_eq!(tensor.byte_len(), 2 * 2 * 3 * 4);
    }

    #[test]
    fn test_tensor_u8_quantizes() {
        let mut tensor = TensorBuf::zeroed(TensorDtype::U8, [1, 1, 1, 4]);
        tensor.set(0, 0, 0, 0.5);
        tensor.set(0, 0, 1, 2.0);
        tensor.set(0, 0, 2, -1.0);
        assert!((tensor.get(0, 0, 0) - 0.5).abs() < 1.0 / 255.0);
        assert_eq!(tensor.get(0, 0, 1), 1.0);
        assert_eq!(tensor.get(0, 0, 2), 0.0);
    }
}
