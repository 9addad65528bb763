//! Frame capture storage for offline replay.
//!
//! A capture is a directory holding a JSON manifest plus raw little-endian
//! f32 planes for each frame's color, velocity, and depth. Replays rebuild
//! [`FrameInputs`] from it; previews are written as binary PPM.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{
    CameraParams, Extent, FrameInputs, Jitter, Texture, TextureFormat, TextureView, ViewRect,
};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureManifest {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub input_extent: Extent,
    pub output_extent: Extent,
    pub camera: CameraParams,
    pub frames: Vec<CaptureFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureFrame {
    /// Plane filenames relative to the capture directory.
    pub color: String,
    pub velocity: String,
    pub depth: String,
    pub jitter: Jitter,
    #[serde(default)]
    pub camera_cut: bool,
}

impl CaptureManifest {
    pub fn new(name: impl Into<String>, input: Extent, output: Extent, camera: CameraParams) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
            input_extent: input,
            output_extent: output,
            camera,
            frames: Vec::new(),
        }
    }

    pub fn load(capture_dir: &Path) -> Result<Self> {
        let path = capture_dir.join(MANIFEST_FILE_NAME);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read capture manifest {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse capture manifest {}", path.display()))
    }

    pub fn save(&self, capture_dir: &Path) -> Result<()> {
        fs::create_dir_all(capture_dir).with_context(|| {
            format!("create capture directory {}", capture_dir.display())
        })?;
        let path = capture_dir.join(MANIFEST_FILE_NAME);
        let encoded =
            serde_json::to_string_pretty(self).context("serialize capture manifest")?;
        fs::write(&path, encoded)
            .with_context(|| format!("write capture manifest {}", path.display()))?;
        Ok(())
    }

    /// Rebuilds the renderer-side inputs for frame `index`.
    pub fn frame_inputs(&self, capture_dir: &Path, index: usize) -> Result<FrameInputs> {
        let frame = self
            .frames
            .get(index)
            .with_context(|| format!("capture has no frame {index}"))?;
        let color = read_plane(
            &capture_dir.join(&frame.color),
            self.input_extent,
            TextureFormat::Rgba32F,
        )?;
        let velocity = read_plane(
            &capture_dir.join(&frame.velocity),
            self.input_extent,
            TextureFormat::Rg32F,
        )?;
        let depth = read_plane(
            &capture_dir.join(&frame.depth),
            self.input_extent,
            TextureFormat::Depth32F,
        )?;
        Ok(FrameInputs {
            scene_color: TextureView::full(Arc::new(color)),
            scene_velocity: TextureView::full(Arc::new(velocity)),
            scene_depth: TextureView::full(Arc::new(depth)),
            output_rect: ViewRect::at_origin(self.output_extent),
            jitter: frame.jitter,
            camera_cut: frame.camera_cut,
            camera: self.camera,
        })
    }
}

/// Reads a raw little-endian f32 plane of the given extent and format.
pub fn read_plane(path: &Path, extent: Extent, format: TextureFormat) -> Result<Texture> {
    let mut file =
        File::open(path).with_context(|| format!("open plane {}", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("read plane {}", path.display()))?;

    let expected = extent.texel_count() * format.channels() * 4;
    if bytes.len() != expected {
        bail!(
            "plane {} is {} bytes, expected {expected} for {}x{}",
            path.display(),
            bytes.len(),
            extent.width,
            extent.height
        );
    }

    let mut texture = Texture::new(extent, format);
    for (texel, chunk) in texture.texels.iter_mut().zip(bytes.chunks_exact(4)) {
        *texel = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(texture)
}

/// Writes a texture's valid region as a raw little-endian f32 plane.
pub fn write_plane(view: &TextureView, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("create plane {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let channels = view.texture.channels();
    for y in 0..view.rect.height {
        for x in 0..view.rect.width {
            let texel = view.texture.texel(view.rect.x + x, view.rect.y + y);
            for c in 0..channels {
                writer.write_all(&texel[c].to_le_bytes())?;
            }
        }
    }
    writer
        .flush()
        .with_context(|| format!("flush plane {}", path.display()))?;
    Ok(())
}

/// Writes an 8-bit binary PPM preview of the view's RGB channels, clamped
/// to [0,1].
pub fn write_ppm_preview(view: &TextureView, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("create preview {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let extent = view.extent();
    write!(writer, "P6\n{} {}\n255\n", extent.width, extent.height)?;
    for y in 0..extent.height {
        for x in 0..extent.width {
            for c in 0..3 {
                let value = view.load(x as i64, y as i64, c);
                writer.write_all(&[(value.clamp(0.0, 1.0) * 255.0).round() as u8])?;
            }
        }
    }
    writer
        .flush()
        .with_context(|| format!("flush preview {}", path.display()))?;
    Ok(())
}
