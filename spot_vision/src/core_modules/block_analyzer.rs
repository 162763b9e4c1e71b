// THEORY:
// The `BlockAnalyzer` is the engine of the extraction layer. Given the pixels of
// one row-block it answers a single question: which bright objects are in here,
// and what do they measure?
//
// Algorithm steps:
// 1.  **Smoothing**: Blur the block with a Gaussian of `blur_sigma` so isolated
//     noisy pixels do not survive thresholding.
// 2.  **Binarization**: A pixel is foreground iff its smoothed value is strictly
//     greater than `threshold`.
// 3.  **Labeling**: Group foreground pixels into components using 4-connectivity
//     (edge neighbours only, never diagonals). Labels are renumbered in raster
//     order of each component's first pixel.
// 4.  **Measurement**: Walk the label map once, feeding every labeled pixel, with
//     its coordinates shifted by the block origin, into that component's
//     `ObjectAccumulator`. Brightness is sampled from the RAW block, never from the
//     blurred copy, so a flat blob of value V always reports V.
//
// The analyzer is stateless. It reads a borrowed view and returns owned results,
// which lets the image analyzer run any number of blocks at once.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::trace;

use crate::config::AnalysisConfig;
use crate::core_modules::block::{Block, BlockView};
use crate::core_modules::detected_object::{DetectedObject, ObjectAccumulator};
use crate::core_modules::smoothing::gaussian_filter;
use crate::error::Result;

const BACKGROUND: u8 = 0;
const FOREGROUND: u8 = 255;

/// The label map of one block. Label `0` is background; components are `1..=component_count`.
#[derive(Debug, Clone)]
pub struct LabeledBlock {
    pub block: Block,
    pub width: u32,
    /// Row-major, same layout as the block's pixels.
    pub labels: Vec<u32>,
    pub component_count: u32,
}

impl LabeledBlock {
    /// Labels of one block-local row.
    pub fn row(&self, row: u32) -> &[u32] {
        let start = (row * self.width) as usize;
        &self.labels[start..start + self.width as usize]
    }
}

/// Smooths, binarizes and labels a block.
pub fn label_block(view: &BlockView<'_>, config: &AnalysisConfig) -> Result<LabeledBlock> {
    config.validate()?;

    let width = view.width;
    let height = view.height();
    if view.pixels.is_empty() {
        return Ok(LabeledBlock {
            block: view.block,
            width,
            labels: Vec::new(),
            component_count: 0,
        });
    }

    let smoothed = gaussian_filter(view.pixels, width as usize, height as usize, config.blur_sigma);
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let value = smoothed[(y * width + x) as usize];
        if f64::from(value) > config.threshold {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    });

    let raw_labels = connected_components(&mask, Connectivity::Four, Luma([BACKGROUND])).into_raw();
    let (labels, component_count) = renumber_in_scan_order(raw_labels);

    trace!(
        row_start = view.block.row_start,
        rows = height,
        components = component_count,
        "labeled block"
    );

    Ok(LabeledBlock {
        block: view.block,
        width,
        labels,
        component_count,
    })
}

/// Rewrites arbitrary component ids as `1..=n` in order of first appearance.
fn renumber_in_scan_order(mut labels: Vec<u32>) -> (Vec<u32>, u32) {
    let max_label = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut remap = vec![0u32; max_label + 1];
    let mut next = 0u32;

    for label in labels.iter_mut() {
        if *label == 0 {
            continue;
        }
        let slot = &mut remap[*label as usize];
        if *slot == 0 {
            next += 1;
            *slot = next;
        }
        *label = *slot;
    }

    (labels, next)
}

/// Per-component accumulators, indexed by `label - 1`, in image coordinates.
pub fn measure_components(view: &BlockView<'_>, labeled: &LabeledBlock) -> Vec<ObjectAccumulator> {
    let mut accumulators = vec![ObjectAccumulator::default(); labeled.component_count as usize];
    if labeled.width == 0 {
        return accumulators;
    }

    let (row_origin, col_origin) = view.block.origin();
    for (i, (&label, &raw)) in labeled.labels.iter().zip(view.pixels).enumerate() {
        if label == 0 {
            continue;
        }
        let row = i as u32 / labeled.width;
        let col = i as u32 % labeled.width;
        accumulators[(label - 1) as usize].add(row + row_origin, col + col_origin, raw);
    }
    accumulators
}

/// Finds every object in a block, with coordinates already in image space.
pub fn analyze_block(view: &BlockView<'_>, config: &AnalysisConfig) -> Result<Vec<DetectedObject>> {
    let labeled = label_block(view, config)?;
    Ok(measure_components(view, &labeled)
        .iter()
        .filter_map(ObjectAccumulator::finish)
        .collect())
}
