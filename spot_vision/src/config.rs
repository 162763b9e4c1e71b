// THEORY:
// Configuration is split by the level it governs. `AnalysisConfig` tunes the
// per-block object extraction and is all the pure analysis code ever sees.
// `BatchConfig` is the immutable description of one batch run: which images,
// where the results go, and how much parallelism to use. The shell builds it
// once and hands it to the `BatchDispatcher`; nothing mutates it afterwards.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SpotError};

/// Smoothed intensity a pixel must strictly exceed to count as foreground.
pub const DEFAULT_THRESHOLD: f64 = 100.0;
/// Standard deviation of the noise-suppression Gaussian, in pixels.
pub const DEFAULT_BLUR_SIGMA: f64 = 1.0;

/// What to do with an object whose pixels straddle two row-blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BoundaryPolicy {
    /// Report one object per block, exactly like the reference detector.
    #[default]
    Split,
    /// Join components that touch across a block boundary into one object.
    Merge,
}

/// Parameters of the block analysis stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisConfig {
    pub threshold: f64,
    pub blur_sigma: f64,
    pub boundary_policy: BoundaryPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            blur_sigma: DEFAULT_BLUR_SIGMA,
            boundary_policy: BoundaryPolicy::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(SpotError::invalid(
                "threshold",
                format!("must be a positive number, got {}", self.threshold),
            ));
        }
        if !self.blur_sigma.is_finite() || self.blur_sigma <= 0.0 {
            return Err(SpotError::invalid(
                "blur_sigma",
                format!("must be a positive number, got {}", self.blur_sigma),
            ));
        }
        Ok(())
    }
}

/// Everything the `BatchDispatcher` needs to process one batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub image_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub analysis: AnalysisConfig,
    /// Number of images processed at the same time.
    pub worker_count: usize,
    /// Number of row-blocks each image is split into.
    pub block_count: usize,
    /// Upper bound on the time spent on a single image. `None` waits forever.
    pub per_image_timeout: Option<Duration>,
}

impl BatchConfig {
    /// Creates a config with default analysis parameters and one worker and one
    /// block per available CPU.
    pub fn new(image_paths: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            image_paths,
            output_dir: output_dir.into(),
            analysis: AnalysisConfig::default(),
            worker_count: cpus,
            block_count: cpus,
            per_image_timeout: None,
        }
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_block_count(mut self, block_count: usize) -> Self {
        self.block_count = block_count;
        self
    }

    pub fn with_per_image_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.per_image_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        if self.worker_count == 0 {
            return Err(SpotError::invalid("worker_count", "must be at least 1"));
        }
        if self.block_count == 0 {
            return Err(SpotError::invalid("block_count", "must be at least 1"));
        }
        if self.per_image_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SpotError::invalid("per_image_timeout", "must be non-zero"));
        }
        Ok(())
    }
}
