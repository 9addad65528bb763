//! Core crate for the tempra temporal super-sampling pipeline.

pub mod capture;
pub mod config;
pub mod debug_view;
pub mod driver;
pub mod engine;
pub mod graph;
pub mod history;
pub mod logging;
pub mod model;
pub mod padding;
pub mod postprocess;
pub mod preprocess;
pub mod runtime;
pub mod types;
pub mod upscaler;
