//! End-to-end replay: a capture written to disk is reloaded, run through
//! the driver on the null engine, and the upscaled planes round-trip back.

use std::sync::Arc;

use tempfile::tempdir;
use tempra_core::capture::{read_plane, write_plane, CaptureFrame, CaptureManifest};
use tempra_core::config::UpscalerConfig;
use tempra_core::driver::UpscalerDriver;
use tempra_core::engine::{EngineRegistry, NullEngine};
use tempra_core::model::{ModelCatalog, ModelEntry};
use tempra_core::types::{
    CameraParams, Extent, Jitter, Texture, TextureFormat, TextureView,
};
use tokio::sync::watch;

const INPUT: Extent = Extent {
    width: 24,
    height: 16,
};
const OUTPUT: Extent = Extent {
    width: 48,
    height: 32,
};

fn write_capture(dir: &std::path::Path, frame_count: usize) -> CaptureManifest {
    let camera = CameraParams {
        tan_half_fov_x: 1.0,
        tan_half_fov_y: 0.6,
    };
    let mut manifest = CaptureManifest::new("roundtrip", INPUT, OUTPUT, camera);

    for index in 0..frame_count {
        let mut color = Texture::new(INPUT, TextureFormat::Rgba32F);
        for y in 0..INPUT.height {
            for x in 0..INPUT.width {
                let texel = color.texel_mut(x, y);
                texel[0] = x as f32 / INPUT.width as f32;
                texel[1] = y as f32 / INPUT.height as f32;
                texel[2] = index as f32 * 0.1;
                texel[3] = 1.0;
            }
        }
        let velocity = Texture::new(INPUT, TextureFormat::Rg32F);
        let depth = Texture::filled(INPUT, TextureFormat::Depth32F, &[0.5]);

        let color_name = format!("frame{index:03}.color.raw");
        let velocity_name = format!("frame{index:03}.velocity.raw");
        let depth_name = format!("frame{index:03}.depth.raw");
        write_plane(&TextureView::full(Arc::new(color)), &dir.join(&color_name))
            .expect("write color plane");
        write_plane(
            &TextureView::full(Arc::new(velocity)),
            &dir.join(&velocity_name),
        )
        .expect("write velocity plane");
        write_plane(&TextureView::full(Arc::new(depth)), &dir.join(&depth_name))
            .expect("write depth plane");

        manifest.frames.push(CaptureFrame {
            color: color_name,
            velocity: velocity_name,
            depth: depth_name,
            jitter: Jitter {
                x: if index % 2 == 0 { 0.25 } else { -0.25 },
                y: 0.0,
            },
            camera_cut: false,
        });
    }

    manifest.save(dir).expect("save manifest");
    manifest
}

fn null_driver() -> UpscalerDriver {
    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(NullEngine::new()));
    let mut catalog = ModelCatalog::new("models");
    catalog.register(ModelEntry {
        name: "test-net".to_string(),
        filename: "test.onnx".to_string(),
        sha256: None,
        description: String::new(),
    });
    let config = UpscalerConfig {
        enabled: true,
        debug_level: 0,
        engine: "null".to_string(),
        model: "test-net".to_string(),
    };
    UpscalerDriver::new(config, registry, catalog)
}

#[tokio::test]
async fn capture_replays_through_driver_and_planes_roundtrip() {
    let capture_dir = tempdir().expect("capture dir");
    let manifest = write_capture(capture_dir.path(), 3);

    let reloaded = CaptureManifest::load(capture_dir.path()).expect("reload manifest");
    assert_eq!(reloaded, manifest);

    let frames: Vec<_> = (0..reloaded.frames.len())
        .map(|index| {
            reloaded
                .frame_inputs(capture_dir.path(), index)
                .expect("frame inputs")
        })
        .collect();
    assert_eq!(frames[0].scene_color.extent(), INPUT);
    assert_eq!(frames[0].output_rect.extent(), OUTPUT);

    let driver = Arc::new(null_driver());
    driver.load_model().expect("load model");

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let results = driver
        .run_views(vec![(0, frames)], cancel_rx)
        .await
        .expect("replay");

    assert_eq!(results.len(), 1);
    let outcomes = &results[0].1;
    assert_eq!(outcomes.len(), 3);

    // Frame 0 runs cold (no history yet); later frames carry history.
    assert!(!outcomes[0].used_history);
    assert!(outcomes[1].used_history);
    assert!(outcomes[2].used_history);
    for outcome in outcomes {
        assert_eq!(outcome.output.extent(), OUTPUT);
    }

    // The upscaled view round-trips through the plane format.
    let out_dir = tempdir().expect("output dir");
    let plane_path = out_dir.path().join("frame0000.color.raw");
    write_plane(&outcomes[2].output, &plane_path).expect("write output plane");
    let restored =
        read_plane(&plane_path, OUTPUT, TextureFormat::Rgba32F).expect("read output plane");
    for y in 0..OUTPUT.height {
        for x in 0..OUTPUT.width {
            let expected = outcomes[2].output.load(x as i64, y as i64, 0);
            assert_eq!(restored.texel(x, y)[0], expected);
        }
    }
}

#[tokio::test]
async fn camera_cut_frame_drops_history() {
    let capture_dir = tempdir().expect("capture dir");
    let mut manifest = write_capture(capture_dir.path(), 3);
    manifest.frames[2].camera_cut = true;
    manifest.save(capture_dir.path()).expect("resave manifest");

    let reloaded = CaptureManifest::load(capture_dir.path()).expect("reload manifest");
    let frames: Vec<_> = (0..reloaded.frames.len())
        .map(|index| {
            reloaded
                .frame_inputs(capture_dir.path(), index)
                .expect("frame inputs")
        })
        .collect();

    let driver = Arc::new(null_driver());
    driver.load_model().expect("load model");

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let results = driver
        .run_views(vec![(0, frames)], cancel_rx)
        .await
        .expect("replay");
    let outcomes = &results[0].1;

    assert!(!outcomes[0].used_history);
    assert!(outcomes[1].used_history);
    assert!(!outcomes[2].used_history);
}
