// THEORY:
// The `ImageAnalyzer` orchestrates the extraction layer for one whole image. It is
// not an analyzer itself. It slices the image into row-blocks, hands every block to
// the `BlockAnalyzer` in parallel, and gathers what comes back into an `ImageResult`.
//
// Key architectural principles:
// 1.  **Independent Blocks**: No block reads another block's pixels or results. The
//     blocks run on the rayon pool and the call returns only after the last one
//     finishes, so callers see a single barrier.
// 2.  **Deterministic Output**: Results are concatenated in block order, and within a
//     block in label order, so the same image always yields the same object list.
// 3.  **Boundary Policy**: Under `BoundaryPolicy::Split` an object crossing a block
//     boundary is reported once per block, which is what the reference detector does.
//     `BoundaryPolicy::Merge` keeps the per-block label maps, unions components whose
//     pixels touch vertically across each boundary, and measures the merged sets.

use image::GrayImage;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{AnalysisConfig, BoundaryPolicy};
use crate::core_modules::block::{Block, partition_rows};
use crate::core_modules::block_analyzer::{LabeledBlock, analyze_block, label_block, measure_components};
use crate::core_modules::detected_object::{DetectedObject, ObjectAccumulator};
use crate::error::{Result, SpotError};

/// Every object found in one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageResult {
    pub image_name: String,
    pub objects: Vec<DetectedObject>,
}

impl ImageResult {
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn total_pixel_count(&self) -> u64 {
        self.objects.iter().map(|o| o.pixel_count).sum()
    }
}

/// Partitions `image` into `block_count` row-blocks and extracts their objects.
pub fn analyze_image(
    image_name: impl Into<String>,
    image: &GrayImage,
    block_count: usize,
    config: &AnalysisConfig,
) -> Result<ImageResult> {
    config.validate()?;
    if image.width() == 0 {
        return Err(SpotError::invalid("width", "image has no columns"));
    }
    let blocks = partition_rows(image.height(), block_count)?;

    let objects = match config.boundary_policy {
        BoundaryPolicy::Split => analyze_split(image, &blocks, config)?,
        BoundaryPolicy::Merge => analyze_merged(image, &blocks, config)?,
    };

    let result = ImageResult {
        image_name: image_name.into(),
        objects,
    };
    debug!(
        image = %result.image_name,
        blocks = blocks.len(),
        objects = result.object_count(),
        "image analyzed"
    );
    Ok(result)
}

fn analyze_split(image: &GrayImage, blocks: &[Block], config: &AnalysisConfig) -> Result<Vec<DetectedObject>> {
    let per_block = blocks
        .par_iter()
        .map(|block| analyze_block(&block.view(image), config))
        .collect::<Result<Vec<_>>>()?;
    Ok(per_block.into_iter().flatten().collect())
}

fn analyze_merged(image: &GrayImage, blocks: &[Block], config: &AnalysisConfig) -> Result<Vec<DetectedObject>> {
    let labeled = blocks
        .par_iter()
        .map(|block| {
            let view = block.view(image);
            let labels = label_block(&view, config)?;
            let accumulators = measure_components(&view, &labels);
            Ok((labels, accumulators))
        })
        .collect::<Result<Vec<(LabeledBlock, Vec<ObjectAccumulator>)>>>()?;

    // Global id of block i's label l is offsets[i] + l - 1.
    let mut offsets = Vec::with_capacity(labeled.len());
    let mut total = 0usize;
    for (labels, _) in &labeled {
        offsets.push(total);
        total += labels.component_count as usize;
    }

    let mut sets = DisjointSet::new(total);
    let non_empty: Vec<usize> = (0..labeled.len())
        .filter(|&i| !labeled[i].0.block.is_empty())
        .collect();

    for pair in non_empty.windows(2) {
        let (upper, lower) = (pair[0], pair[1]);
        let upper_labels = &labeled[upper].0;
        let lower_labels = &labeled[lower].0;
        let last_row = upper_labels.row(upper_labels.block.row_count - 1);
        let first_row = lower_labels.row(0);

        for (&a, &b) in last_row.iter().zip(first_row) {
            if a != 0 && b != 0 {
                sets.union(
                    offsets[upper] + a as usize - 1,
                    offsets[lower] + b as usize - 1,
                );
            }
        }
    }

    // Roots are visited in block then label order, so the first member of every set
    // decides where the merged object appears in the output.
    let mut merged: Vec<ObjectAccumulator> = vec![ObjectAccumulator::default(); total];
    let mut order = Vec::new();
    for (block_index, (_, accumulators)) in labeled.iter().enumerate() {
        for (local, accumulator) in accumulators.iter().enumerate() {
            let root = sets.find(offsets[block_index] + local);
            if merged[root].is_empty() {
                order.push(root);
            }
            merged[root].merge(accumulator);
        }
    }

    Ok(order.into_iter().filter_map(|root| merged[root].finish()).collect())
}

/// Union-find over component ids with path halving and union by size.
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn sharp(policy: BoundaryPolicy) -> AnalysisConfig {
        AnalysisConfig {
            threshold: 100.0,
            blur_sigma: 0.01,
            boundary_policy: policy,
        }
    }

    /// A deterministic, noisy-looking test card without pulling in an RNG.
    fn test_card(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let h = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663) ^ (x * y).wrapping_mul(83_492_791);
            let noise = (h % 97) as u8;
            let spot = if (x / 7 + y / 5) % 3 == 0 { 150 } else { 0 };
            Luma([noise.saturating_add(spot)])
        })
    }

    /// 2-pixel-wide vertical bar crossing the middle of an 8-row image.
    fn bar_image() -> GrayImage {
        let mut image = GrayImage::new(6, 8);
        for row in 2..6 {
            image.put_pixel(2, row, Luma([220]));
            image.put_pixel(3, row, Luma([220]));
        }
        image
    }

    #[test]
    fn four_by_four_example_through_the_image_analyzer() {
        let mut image = GrayImage::new(4, 4);
        for row in 1..=2 {
            for col in 1..=2 {
                image.put_pixel(col, row, Luma([200]));
            }
        }
        let result = analyze_image("square.png", &image, 1, &sharp(BoundaryPolicy::Split)).unwrap();
        assert_eq!(result.image_name, "square.png");
        assert_eq!(result.objects.len(), 1);
        let object = &result.objects[0];
        assert_eq!((object.x_center, object.y_center), (1, 1));
        assert_eq!((object.width, object.height), (2, 2));
        assert_eq!(object.pixel_count, 4);
        assert_eq!(object.mean_brightness, 200.0);
    }

    #[test]
    fn object_crossing_a_block_boundary_is_split() {
        let image = bar_image();
        let result = analyze_image("bar", &image, 2, &sharp(BoundaryPolicy::Split)).unwrap();
        assert_eq!(result.objects.len(), 2);
        assert_eq!(result.objects[0].pixel_count, 4);
        assert_eq!(result.objects[1].pixel_count, 4);
        assert_eq!(result.objects[0].x_center, 2); // rows 2..=3
        assert_eq!(result.objects[1].x_center, 4); // rows 4..=5
    }

    #[test]
    fn merge_policy_rejoins_boundary_objects() {
        let image = bar_image();
        let result = analyze_image("bar", &image, 2, &sharp(BoundaryPolicy::Merge)).unwrap();
        assert_eq!(result.objects.len(), 1);
        let object = &result.objects[0];
        assert_eq!(object.pixel_count, 8);
        assert_eq!(object.height, 4);
        assert_eq!(object.width, 2);
        assert_eq!(object.x_center, 3);
        assert_eq!(object.mean_brightness, 220.0);
    }

    #[test]
    fn merge_matches_single_block_analysis() {
        let image = test_card(40, 37);
        let config = sharp(BoundaryPolicy::Merge);
        let whole = analyze_image("card", &image, 1, &config).unwrap();
        for blocks in [2, 3, 5, 8, 50] {
            let merged = analyze_image("card", &image, blocks, &config).unwrap();
            assert_eq!(merged.object_count(), whole.object_count(), "{blocks} blocks");
            assert_eq!(merged.total_pixel_count(), whole.total_pixel_count());
        }
    }

    #[test]
    fn split_never_loses_foreground_pixels() {
        let image = test_card(33, 29);
        let config = sharp(BoundaryPolicy::Split);
        let whole = analyze_image("card", &image, 1, &config).unwrap();
        for blocks in [2, 4, 7, 40] {
            let split = analyze_image("card", &image, blocks, &config).unwrap();
            assert_eq!(split.total_pixel_count(), whole.total_pixel_count());
            assert!(split.object_count() >= whole.object_count());
        }
    }

    #[test]
    fn raising_threshold_never_adds_pixels() {
        let image = test_card(48, 32);
        let mut previous = u64::MAX;
        for threshold in [20.0, 60.0, 100.0, 140.0, 180.0, 230.0] {
            let config = AnalysisConfig {
                threshold,
                ..AnalysisConfig::default()
            };
            let total = analyze_image("card", &image, 4, &config).unwrap().total_pixel_count();
            assert!(total <= previous, "threshold {threshold}: {total} > {previous}");
            previous = total;
        }
    }

    #[test]
    fn more_blocks_than_rows_still_works() {
        let image = bar_image();
        let result = analyze_image("bar", &image, 64, &sharp(BoundaryPolicy::Split)).unwrap();
        assert_eq!(result.total_pixel_count(), 8);
    }

    #[test]
    fn disjoint_set_unions_transitively() {
        let mut sets = DisjointSet::new(5);
        sets.union(0, 1);
        sets.union(3, 4);
        sets.union(1, 4);
        assert_eq!(sets.find(0), sets.find(3));
        assert_ne!(sets.find(0), sets.find(2));
    }
}
