// THEORY:
// The `pipeline` module is the per-image API of the engine. It strings the core
// modules together into the full journey of a single image:
//
//     decode -> ImageAnalyzer -> AnnotationRenderer -> save -> StatisticsTable
//
// `ImageProcessor` carries everything that stays fixed across a batch: analysis
// parameters, block count, output directory and the shared table. One instance is
// shared by every worker. `process` is synchronous and CPU-bound, and the batch
// layer is responsible for running it off the async runtime.
//
// The module also owns the filesystem conventions: which files count as images,
// and where the annotated copy of each one is written.
//
// An image's output is all or nothing. `process_claimed` takes an `OutputClaim`
// shared with whoever is waiting on the image. The table append commits the claim
// under the table lock. If the waiter abandoned it first, the rows are never
// written and the annotated copy is removed again. A failed append also removes
// the annotated copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use image::GrayImage;
use tracing::{debug, instrument, warn};

use crate::config::AnalysisConfig;
use crate::core_modules::annotation::render_annotations;
use crate::core_modules::image_analyzer::{ImageResult, analyze_image};
use crate::core_modules::statistics_table::StatisticsTable;
use crate::error::{Result, SpotError};

/// Extensions (lower case, without the dot) accepted as input images.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "tiff"];
/// Appended to the input stem to name the annotated output.
pub const PROCESSED_SUFFIX: &str = "_processed";
const OUTPUT_EXTENSION: &str = "png";

/// True for files whose extension is one of `SUPPORTED_EXTENSIONS`, in any letter
/// case (`a.PNG` counts).
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
}

/// Lists the supported images directly inside `dir`, sorted by path.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| SpotError::io(dir, e))?;

    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SpotError::io(dir, e))?;
        let path = entry.path();
        if path.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// File name used to identify an image in progress messages and the table.
pub fn image_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// `<output_dir>/<stem>_processed.png`
pub fn processed_output_path(output_dir: &Path, image_path: &Path) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_dir.join(format!("{stem}{PROCESSED_SUFFIX}.{OUTPUT_EXTENSION}"))
}

/// Opens an image of any supported format and converts it to 8-bit luma.
pub fn decode_grayscale(path: &Path) -> Result<GrayImage> {
    let image = image::open(path).map_err(|source| SpotError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_luma8())
}

const CLAIM_RUNNING: u8 = 0;
const CLAIM_COMMITTED: u8 = 1;
const CLAIM_ABANDONED: u8 = 2;

/// Decides, exactly once, whether a running image's output is kept.
#[derive(Debug, Default)]
pub struct OutputClaim(AtomicU8);

impl OutputClaim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the output as kept. Fails if the claim was already abandoned.
    pub fn commit(&self) -> bool {
        self.transition(CLAIM_COMMITTED)
    }

    /// Gives up on the output. Fails if it was already committed.
    pub fn abandon(&self) -> bool {
        self.transition(CLAIM_ABANDONED)
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == CLAIM_ABANDONED
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(CLAIM_RUNNING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Runs the full per-image pipeline against a shared output table.
#[derive(Debug)]
pub struct ImageProcessor {
    analysis: AnalysisConfig,
    block_count: usize,
    output_dir: PathBuf,
    table: Arc<StatisticsTable>,
}

impl ImageProcessor {
    pub fn new(
        analysis: AnalysisConfig,
        block_count: usize,
        output_dir: impl Into<PathBuf>,
        table: Arc<StatisticsTable>,
    ) -> Self {
        Self {
            analysis,
            block_count,
            output_dir: output_dir.into(),
            table,
        }
    }

    pub fn table(&self) -> &StatisticsTable {
        &self.table
    }

    pub fn process(&self, path: &Path) -> Result<ImageResult> {
        self.process_claimed(path, &OutputClaim::new())
    }

    #[instrument(skip(self, claim), fields(image = %image_name(path)))]
    pub fn process_claimed(&self, path: &Path, claim: &OutputClaim) -> Result<ImageResult> {
        // Stage 1: Decode
        let image = decode_grayscale(path)?;

        // Stage 2: Object extraction
        let result = analyze_image(image_name(path), &image, self.block_count, &self.analysis)?;
        if claim.is_abandoned() {
            return Err(SpotError::Abandoned);
        }

        // Stage 3: Annotation
        let annotated = render_annotations(&image, &result.objects);
        let output_path = processed_output_path(&self.output_dir, path);
        annotated.save(&output_path).map_err(|source| SpotError::Encode {
            path: output_path.clone(),
            source,
        })?;

        // Stage 4: Tabulation
        let appended = self
            .table
            .append_if(&result.image_name, &result.objects, || claim.commit());
        match appended {
            Ok(Some(_)) => {}
            Ok(None) => {
                discard_output(&output_path);
                return Err(SpotError::Abandoned);
            }
            Err(err) => {
                discard_output(&output_path);
                return Err(err);
            }
        }

        debug!(
            objects = result.object_count(),
            output = %output_path.display(),
            "image processed"
        );
        Ok(result)
    }
}

fn discard_output(output_path: &Path) {
    if let Err(err) = std::fs::remove_file(output_path) {
        warn!(output = %output_path.display(), error = %err, "could not remove annotated image");
    }
}
