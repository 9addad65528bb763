//! The temporal upscaler: records and runs one frame's pass graph.
//!
//! A frame flows pad -> preprocess -> inference -> postprocess. Any failure
//! while recording or executing produces a solid warning-yellow frame and
//! drops the temporal history rather than surfacing a hard error to the
//! renderer.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info};

use crate::debug_view::{DebugSnapshot, DebugSnapshotCell};
use crate::engine::ModelInstance;
use crate::graph::{FrameGraph, FrameResources};
use crate::history::{resolve_history, HistoryLayout, HistoryRecord, TemporalHistory};
use crate::model::{
    LoadedModel, ModelPrecision, OutputIndexTable, OutputTensor, INPUT_CHANNELS, OUTPUT_CHANNELS,
    OUTPUT_TENSOR_COUNT,
};
use crate::padding::{pad_to_tile, padded_extent, padded_output_extent};
use crate::postprocess::{run_postprocess, PostprocessParams};
use crate::preprocess::{disocclusion_constants, run_preprocess, PreprocessParams};
use crate::types::{
    FrameInputs, TensorBuf, Texture, TextureDesc, TextureFormat, TextureView, ViewRect,
};

/// Solid warning color emitted when a frame fails: unmistakable in captures,
/// harmless to the swapchain.
pub const FALLBACK_COLOR: [f32; 4] = [1.0, 1.0, 0.0, 1.0];

/// Result of one upscale invocation.
#[derive(Debug, Clone)]
pub struct UpscaleOutcome {
    /// Reconstructed color; the rect crops the padded surface back to the
    /// requested output size.
    pub output: TextureView,
    /// History to carry into the next frame. Absent after a failure.
    pub history: TemporalHistory,
    /// Whether the previous frame's history actually fed this one.
    pub used_history: bool,
}

/// One upscaling strategy. The driver forks a fresh instance per frame with
/// that frame's settings baked in.
pub trait TemporalUpscaler: Send {
    fn name(&self) -> &'static str;

    fn upscale(
        &self,
        inputs: &FrameInputs,
        history: &TemporalHistory,
        snapshot: &DebugSnapshotCell,
    ) -> UpscaleOutcome;
}

/// Disabled variant: passes the input color through untouched and keeps no
/// history.
pub struct NullUpscaler;

impl TemporalUpscaler for NullUpscaler {
    fn name(&self) -> &'static str {
        "null"
    }

    fn upscale(
        &self,
        inputs: &FrameInputs,
        _history: &TemporalHistory,
        snapshot: &DebugSnapshotCell,
    ) -> UpscaleOutcome {
        snapshot.invalidate();
        UpscaleOutcome {
            output: inputs.scene_color.clone(),
            history: TemporalHistory::Absent,
            used_history: false,
        }
    }
}

pub struct NeuralUpscaler {
    model: Arc<Mutex<Box<dyn ModelInstance>>>,
    precision: ModelPrecision,
    output_table: OutputIndexTable,
    history_enabled: bool,
    debug_level: u8,
}

impl NeuralUpscaler {
    pub fn new(model: &LoadedModel, history_enabled: bool, debug_level: u8) -> Self {
        Self {
            model: Arc::clone(&model.instance),
            precision: model.precision,
            output_table: model.output_table,
            history_enabled,
            debug_level,
        }
    }

    fn failure_frame(output_rect: ViewRect, snapshot: &DebugSnapshotCell) -> UpscaleOutcome {
        snapshot.invalidate();
        let texture = Arc::new(Texture::filled(
            output_rect.extent(),
            TextureFormat::Rgba32F,
            &FALLBACK_COLOR,
        ));
        UpscaleOutcome {
            output: TextureView::full(texture),
            history: TemporalHistory::Absent,
            used_history: false,
        }
    }

    fn run_frame(
        &self,
        inputs: &FrameInputs,
        history: &TemporalHistory,
        snapshot: &DebugSnapshotCell,
    ) -> Result<UpscaleOutcome> {
        let in_extent = inputs.scene_color.extent();
        let out_extent = inputs.output_rect.extent();
        if in_extent.texel_count() == 0 || out_extent.texel_count() == 0 {
            bail!("degenerate input or output extent");
        }
        if inputs.scene_velocity.extent() != in_extent
            || inputs.scene_depth.extent() != in_extent
        {
            bail!(
                "input surfaces disagree: color {:?}, velocity {:?}, depth {:?}",
                in_extent,
                inputs.scene_velocity.extent(),
                inputs.scene_depth.extent()
            );
        }

        let padded_in = padded_extent(in_extent);
        let padded_out = padded_output_extent(in_extent, out_extent);
        let width = padded_in.width as usize;
        let height = padded_in.height as usize;

        let layout = HistoryLayout {
            upscaled_extent: padded_out,
            depth_rect: ViewRect::at_origin(in_extent),
            aux_extent: padded_in,
            feedback_bytes: padded_in.texel_count()
                * OUTPUT_CHANNELS
                * self.precision.output_dtype().element_size(),
        };
        let resolved = resolve_history(
            history,
            &layout,
            inputs.camera_cut,
            self.history_enabled,
            &inputs.scene_depth,
            self.precision,
        );
        let constants = disocclusion_constants(&inputs.camera, padded_in);

        let mut resources = FrameResources::new();
        let padded_color = resources.declare_texture(TextureDesc {
            extent: padded_in,
            format: TextureFormat::Rgba32F,
        });
        let padded_velocity = resources.declare_texture(TextureDesc {
            extent: padded_in,
            format: TextureFormat::Rg32F,
        });
        let padded_depth = resources.declare_texture(TextureDesc {
            extent: padded_in,
            format: TextureFormat::Depth32F,
        });
        let input_tensor = resources.declare_tensor(
            self.precision.input_dtype(),
            [1, height, width, INPUT_CHANNELS],
        );
        let luma_plane = resources.declare_texture(TextureDesc {
            extent: padded_in,
            format: TextureFormat::Rg32F,
        });
        let depth_offset = resources.declare_texture(TextureDesc {
            extent: padded_in,
            format: TextureFormat::R32F,
        });
        let semantic_outputs: Vec<_> = OutputTensor::ALL
            .iter()
            .map(|_| {
                resources.declare_tensor(
                    self.precision.output_dtype(),
                    [1, height, width, OUTPUT_CHANNELS],
                )
            })
            .collect();
        let output_color = resources.declare_texture(TextureDesc {
            extent: padded_out,
            format: TextureFormat::Rgba32F,
        });

        let mut graph = FrameGraph::new();

        graph.add_pass(
            "pad",
            &[],
            &[padded_color, padded_velocity, padded_depth],
            |res| {
                res.replace_texture(
                    padded_color,
                    pad_to_tile(&inputs.scene_color, TextureFormat::Rgba32F),
                );
                res.replace_texture(
                    padded_velocity,
                    pad_to_tile(&inputs.scene_velocity, TextureFormat::Rg32F),
                );
                res.replace_texture(
                    padded_depth,
                    pad_to_tile(&inputs.scene_depth, TextureFormat::Depth32F),
                );
                Ok(())
            },
        );

        graph.add_pass(
            "preprocess",
            &[padded_color, padded_velocity, padded_depth],
            &[input_tensor, luma_plane, depth_offset],
            |res| {
                let color = Arc::clone(res.texture(padded_color)?);
                let velocity = Arc::clone(res.texture(padded_velocity)?);
                let depth = Arc::clone(res.texture(padded_depth)?);
                let outputs = run_preprocess(&PreprocessParams {
                    color: &color,
                    velocity: &velocity,
                    depth: &depth,
                    history: &resolved,
                    jitter: inputs.jitter,
                    constants,
                    precision: self.precision,
                })?;
                res.put_tensor(input_tensor, outputs.input_tensor);
                res.put_texture(luma_plane, outputs.luma_deriv);
                res.put_texture(depth_offset, outputs.depth_offset);
                Ok(())
            },
        );

        graph.add_pass("inference", &[input_tensor], &semantic_outputs, |res| {
            let input = res.take_tensor(input_tensor)?;
            let shape = [1, height, width, INPUT_CHANNELS];
            let mut model = self
                .model
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if model.input_shape() != Some(shape) {
                model
                    .set_input_shape(shape)
                    .context("configure network input shape")?;
                info!(
                    height,
                    width,
                    channels = INPUT_CHANNELS,
                    "network input shape configured"
                );
            }
            let expected = [1, height, width, OUTPUT_CHANNELS];
            for slot in 0..OUTPUT_TENSOR_COUNT {
                let got = model.output_shape(slot)?;
                if got != expected {
                    bail!("network output {slot} has shape {got:?}, expected {expected:?}");
                }
            }
            let mut positional: Vec<TensorBuf> = (0..OUTPUT_TENSOR_COUNT)
                .map(|_| TensorBuf::zeroed(self.precision.output_dtype(), expected))
                .collect();
            model.run(&input, &mut positional).context("run inference")?;
            drop(model);
            res.put_tensor(input_tensor, input);
            for (slot, tensor) in positional.into_iter().enumerate() {
                let semantic = self
                    .output_table
                    .tensor_at_slot(slot)
                    .ok_or_else(|| anyhow!("no semantic binding for output slot {slot}"))?;
                res.put_tensor(semantic_outputs[semantic.ordinal()], tensor);
            }
            Ok(())
        });

        let filter_ids = [
            semantic_outputs[OutputTensor::KpnFilterCol0.ordinal()],
            semantic_outputs[OutputTensor::KpnFilterCol1.ordinal()],
            semantic_outputs[OutputTensor::KpnFilterCol2.ordinal()],
            semantic_outputs[OutputTensor::KpnFilterCol3.ordinal()],
        ];
        let theta_alpha_id = semantic_outputs[OutputTensor::ThetaAlpha.ordinal()];
        let mut postprocess_reads = semantic_outputs.clone();
        postprocess_reads.push(padded_color);
        postprocess_reads.push(luma_plane);
        graph.add_pass(
            "postprocess",
            &postprocess_reads,
            &[output_color, luma_plane],
            |res| {
                let theta_alpha = res.take_tensor(theta_alpha_id)?;
                let col0 = res.take_tensor(filter_ids[0])?;
                let col1 = res.take_tensor(filter_ids[1])?;
                let col2 = res.take_tensor(filter_ids[2])?;
                let col3 = res.take_tensor(filter_ids[3])?;
                let color = Arc::clone(res.texture(padded_color)?);
                let mut luma = res.take_texture(luma_plane)?;
                let reconstructed = run_postprocess(
                    &PostprocessParams {
                        theta_alpha: &theta_alpha,
                        filters: [&col0, &col1, &col2, &col3],
                        color: &color,
                        prev_upscaled: &resolved.upscaled_color,
                        jitter: inputs.jitter,
                        treat_as_camera_cut: resolved.treat_as_camera_cut,
                        padded_output: padded_out,
                    },
                    &mut luma,
                )?;
                res.put_texture(output_color, reconstructed);
                res.put_texture(luma_plane, luma);
                res.put_tensor(theta_alpha_id, theta_alpha);
                res.put_tensor(filter_ids[0], col0);
                res.put_tensor(filter_ids[1], col1);
                res.put_tensor(filter_ids[2], col2);
                res.put_tensor(filter_ids[3], col3);
                Ok(())
            },
        );

        graph.execute(&mut resources)?;

        if self.debug_level > 0 {
            let outputs = OutputTensor::ALL
                .iter()
                .map(|tensor| {
                    Ok(resources
                        .tensor(semantic_outputs[tensor.ordinal()])?
                        .clone())
                })
                .collect::<Result<Vec<_>>>()?;
            snapshot.store(DebugSnapshot {
                precision: self.precision,
                preprocessed: resources.tensor(input_tensor)?.clone(),
                depth_offset: Arc::clone(resources.texture(depth_offset)?),
                outputs,
            });
        }

        let output_texture = Arc::clone(resources.texture(output_color)?);
        let record = HistoryRecord {
            upscaled_color: Arc::clone(&output_texture),
            depth: TextureView {
                texture: Arc::clone(resources.texture(padded_depth)?),
                rect: ViewRect::at_origin(in_extent),
            },
            luma_deriv: Arc::clone(resources.texture(luma_plane)?),
            depth_offset: Arc::clone(resources.texture(depth_offset)?),
            feedback: resources
                .tensor(semantic_outputs[OutputTensor::Feedback.ordinal()])?
                .clone(),
            jitter: inputs.jitter,
        };

        Ok(UpscaleOutcome {
            output: TextureView {
                texture: output_texture,
                rect: ViewRect::at_origin(out_extent),
            },
            history: TemporalHistory::Valid(record),
            used_history: !resolved.treat_as_camera_cut,
        })
    }
}

impl TemporalUpscaler for NeuralUpscaler {
    fn name(&self) -> &'static str {
        "neural"
    }

    fn upscale(
        &self,
        inputs: &FrameInputs,
        history: &TemporalHistory,
        snapshot: &DebugSnapshotCell,
    ) -> UpscaleOutcome {
        snapshot.invalidate();
        match self.run_frame(inputs, history, snapshot) {
            Ok(outcome) => outcome,
            Err(frame_error) => {
                error!(
                    error = format!("{frame_error:#}"),
                    "frame failed, emitting fallback frame and dropping history"
                );
                Self::failure_frame(inputs.output_rect, snapshot)
            }
        }
    }
}
