//! Upscaler driver: owns the loaded model, per-view state, and the frame
//! gating switches (enable flag, competing-upscaler guard, history skip).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::UpscalerConfig;
use crate::debug_view::DebugSnapshotCell;
use crate::engine::EngineRegistry;
use crate::history::TemporalHistory;
use crate::model::{load_model, LoadedModel, ModelCatalog};
use crate::types::FrameInputs;
use crate::upscaler::{NeuralUpscaler, TemporalUpscaler, UpscaleOutcome};

/// Frames each view runs without history after a model (re)load, so the
/// new network never sees feedback produced by the old one.
pub const SKIP_HISTORY_FRAMES_AFTER_LOAD: u32 = 1;

/// Immutable per-frame settings sampled by [`UpscalerDriver::begin_frame`].
#[derive(Debug, Clone, Copy)]
pub struct FrameSettings {
    pub history_enabled: bool,
    pub debug_level: u8,
}

#[derive(Default)]
struct ViewState {
    history: TemporalHistory,
    snapshot: Arc<DebugSnapshotCell>,
    /// Remaining frames this view must run cold after a model reload.
    skip_history_frames: u32,
}

pub struct UpscalerDriver {
    config: UpscalerConfig,
    registry: EngineRegistry,
    catalog: ModelCatalog,
    model: Mutex<Option<LoadedModel>>,
    history_disabled: AtomicBool,
    debug_level: AtomicU8,
    external_upscaler: AtomicBool,
    views: DashMap<u64, ViewState>,
}

impl UpscalerDriver {
    pub fn new(config: UpscalerConfig, registry: EngineRegistry, catalog: ModelCatalog) -> Self {
        let debug_level = config.debug_level;
        Self {
            config,
            registry,
            catalog,
            model: Mutex::new(None),
            history_disabled: AtomicBool::new(false),
            debug_level: AtomicU8::new(debug_level),
            external_upscaler: AtomicBool::new(false),
            views: DashMap::new(),
        }
    }

    /// Loads (or reloads) the configured model and arms the history skip on
    /// every known view so each one's next frame runs cold. Views created
    /// later start with no history and are cold anyway.
    pub fn load_model(&self) -> Result<()> {
        let engine = self
            .registry
            .resolve(&self.config.engine)
            .context("resolve configured inference engine")?;
        let loaded = load_model(engine.as_ref(), &self.catalog, &self.config.model)?;
        *self.model_slot() = Some(loaded);
        for mut view in self.views.iter_mut() {
            view.skip_history_frames = SKIP_HISTORY_FRAMES_AFTER_LOAD;
        }
        Ok(())
    }

    pub fn loaded_model(&self) -> Option<LoadedModel> {
        self.model_slot().clone()
    }

    fn model_slot(&self) -> std::sync::MutexGuard<'_, Option<LoadedModel>> {
        self.model
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The driver runs only when enabled, a model is loaded, and no other
    /// upscaler has claimed the frame.
    pub fn is_active(&self) -> bool {
        self.config.enabled
            && !self.external_upscaler.load(Ordering::SeqCst)
            && self.model_slot().is_some()
    }

    /// Marks that another upscaler is installed on the view; this driver
    /// stands down until cleared.
    pub fn set_external_upscaler(&self, installed: bool) {
        self.external_upscaler.store(installed, Ordering::SeqCst);
    }

    pub fn set_history_enabled(&self, enabled: bool) {
        self.history_disabled.store(!enabled, Ordering::SeqCst);
    }

    pub fn set_debug_level(&self, level: u8) {
        self.debug_level.store(level, Ordering::SeqCst);
    }

    /// Samples the frame-global toggles. Called once per frame; the
    /// post-reload history skip is per view and consumed in
    /// [`process_frame`](UpscalerDriver::process_frame).
    pub fn begin_frame(&self) -> FrameSettings {
        FrameSettings {
            history_enabled: !self.history_disabled.load(Ordering::SeqCst),
            debug_level: self.debug_level.load(Ordering::SeqCst),
        }
    }

    /// Upscales one frame for `view_id`, carrying that view's history and
    /// consuming one armed history skip, if any. Returns `None` when the
    /// driver is inactive.
    pub fn process_frame(
        &self,
        view_id: u64,
        inputs: &FrameInputs,
        settings: &FrameSettings,
    ) -> Option<UpscaleOutcome> {
        if !self.is_active() {
            return None;
        }
        let model = self.loaded_model()?;
        let mut view = self.views.entry(view_id).or_default();
        let skip = view.skip_history_frames > 0;
        if skip {
            view.skip_history_frames -= 1;
        }
        let history_enabled = settings.history_enabled && !skip;
        let upscaler = NeuralUpscaler::new(&model, history_enabled, settings.debug_level);
        let outcome = upscaler.upscale(inputs, &view.history, &view.snapshot);
        view.history = outcome.history.clone();
        Some(outcome)
    }

    pub fn debug_snapshot(&self, view_id: u64) -> Option<Arc<DebugSnapshotCell>> {
        self.views
            .get(&view_id)
            .map(|view| Arc::clone(&view.snapshot))
    }

    /// Drops everything remembered about a view.
    pub fn reset_view(&self, view_id: u64) {
        self.views.remove(&view_id);
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Replays several views' frame sequences concurrently, one blocking
    /// task per view. Cancellation stops each view at its next frame
    /// boundary. The first view error wins; remaining views still finish.
    pub async fn run_views(
        self: &Arc<Self>,
        sequences: Vec<(u64, Vec<FrameInputs>)>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<(u64, Vec<UpscaleOutcome>)>> {
        let mut handles = Vec::with_capacity(sequences.len());
        for (view_id, frames) in sequences {
            let driver = Arc::clone(self);
            let cancel = cancel.clone();
            let handle = tokio::task::spawn_blocking(move || -> Result<Vec<UpscaleOutcome>> {
                let mut outcomes = Vec::with_capacity(frames.len());
                for inputs in &frames {
                    if *cancel.borrow() {
                        info!(view_id, frames_done = outcomes.len(), "view replay cancelled");
                        break;
                    }
                    let settings = driver.begin_frame();
                    let outcome = driver
                        .process_frame(view_id, inputs, &settings)
                        .ok_or_else(|| anyhow!("upscaler is not active for view {view_id}"))?;
                    outcomes.push(outcome);
                }
                Ok(outcomes)
            });
            handles.push((view_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (view_id, handle) in handles {
            match handle.await {
                Ok(Ok(outcomes)) => results.push((view_id, outcomes)),
                Ok(Err(view_error)) => {
                    error!(view_id, error = format!("{view_error:#}"), "view replay failed");
                    if first_error.is_none() {
                        first_error = Some(view_error);
                    }
                }
                Err(join_error) => {
                    error!(view_id, error = %join_error, "view replay task panicked");
                    if first_error.is_none() {
                        first_error = Some(anyhow!("view {view_id} task failed: {join_error}"));
                    }
                }
            }
        }
        match first_error {
            Some(first_error) => Err(first_error),
            None => Ok(results),
        }
    }
}
