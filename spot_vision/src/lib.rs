// THEORY:
// This file is the entry point of the `spot_vision` library crate. It exposes two
// levels of API:
//
// - The per-image pipeline (`pipeline::ImageProcessor`) and the pure analysis
//   functions under `core_modules`, for callers that want to analyze one image or
//   one block in isolation.
// - The batch layer (`parallel_pipeline::BatchDispatcher`), which an external shell
//   drives with a `BatchConfig`, a channel for `BatchEvent`s and a `CancelFlag`.
//
// The shell (folder pickers, progress displays) is not part of the
// crate. It only supplies image paths and an output directory, and consumes
// status events.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::{AnalysisConfig, BatchConfig, BoundaryPolicy};
pub use core_modules::detected_object::DetectedObject;
pub use core_modules::image_analyzer::{ImageResult, analyze_image};
pub use error::{Result, SpotError};
pub use parallel_pipeline::{BatchDispatcher, BatchEvent, BatchSummary, CancelFlag, Outcome, ProgressEvent};
pub use pipeline::{ImageProcessor, discover_images};
