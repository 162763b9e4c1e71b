// THEORY:
// A `Block` is a horizontal slice of an image: a run of whole rows. Blocks are the
// unit of image-level parallelism. Each one is smoothed, thresholded and labeled
// on its own, so the analyzer can fan them out across threads with no
// coordination beyond the final concatenation.
//
// Key principles:
// 1.  **Exact Partition**: The blocks of an image never overlap and never leave a
//     row out. Every block except the last is `height / count` rows tall; the last
//     one runs to the bottom of the image and absorbs the remainder.
// 2.  **Dumb Geometry**: A `Block` only knows which rows it covers. Pixel access
//     goes through a borrowed `BlockView`, which is a zero-copy window into the
//     image's row-major buffer.
// 3.  **Origin Offset**: Rows inside a block are numbered from zero. The block's
//     origin `(row_start, 0)` translates those local coordinates back into image
//     space.

use image::GrayImage;

use crate::error::{Result, SpotError};

/// A contiguous range of whole image rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub row_start: u32,
    pub row_count: u32,
}

impl Block {
    /// One past the last row covered by this block.
    pub fn row_end(&self) -> u32 {
        self.row_start + self.row_count
    }

    /// Offset of the block's local `(0, 0)` in image coordinates, as `(row, column)`.
    pub fn origin(&self) -> (u32, u32) {
        (self.row_start, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Borrows the block's pixels out of `image`.
    pub fn view<'a>(&self, image: &'a GrayImage) -> BlockView<'a> {
        let width = image.width() as usize;
        let start = self.row_start as usize * width;
        let end = self.row_end() as usize * width;
        BlockView {
            block: *self,
            width: image.width(),
            pixels: &image.as_raw()[start..end],
        }
    }
}

/// Read-only window onto the rows of a `Block`.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    pub block: Block,
    pub width: u32,
    /// Row-major samples, `width * block.row_count` long.
    pub pixels: &'a [u8],
}

impl<'a> BlockView<'a> {
    /// Wraps a raw row-major buffer. Used when the caller owns the pixels directly.
    pub fn new(block: Block, width: u32, pixels: &'a [u8]) -> Result<Self> {
        let expected = width as usize * block.row_count as usize;
        if pixels.len() != expected {
            return Err(SpotError::invalid(
                "pixels",
                format!(
                    "expected {expected} samples for a {width}x{} block, got {}",
                    block.row_count,
                    pixels.len()
                ),
            ));
        }
        Ok(Self {
            block,
            width,
            pixels,
        })
    }

    pub fn height(&self) -> u32 {
        self.block.row_count
    }
}

/// Splits `height` rows into `block_count` row-aligned blocks.
///
/// When `block_count` exceeds `height`, the leading blocks are empty and the last
/// block covers every row; no row is ever dropped.
pub fn partition_rows(height: u32, block_count: usize) -> Result<Vec<Block>> {
    if height == 0 {
        return Err(SpotError::invalid("height", "image has no rows"));
    }
    if block_count == 0 {
        return Err(SpotError::invalid("block_count", "must be at least 1"));
    }

    let count = u32::try_from(block_count)
        .map_err(|_| SpotError::invalid("block_count", format!("{block_count} is too large")))?;
    let block_height = height / count;

    let blocks = (0..count)
        .map(|i| {
            let row_start = i * block_height;
            let row_end = if i == count - 1 {
                height
            } else {
                (i + 1) * block_height
            };
            Block {
                row_start,
                row_count: row_end - row_start,
            }
        })
        .collect();

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(height: u32, blocks: &[Block]) {
        let mut covered = vec![0u32; height as usize];
        for block in blocks {
            for row in block.row_start..block.row_end() {
                covered[row as usize] += 1;
            }
        }
        assert!(
            covered.iter().all(|&c| c == 1),
            "rows not covered exactly once for height {height}: {blocks:?}"
        );
    }

    #[test]
    fn blocks_cover_every_row_exactly_once() {
        for height in 1..=64 {
            for count in 1..=80 {
                let blocks = partition_rows(height, count).unwrap();
                assert_eq!(blocks.len(), count);
                assert_exact_cover(height, &blocks);
            }
        }
    }

    #[test]
    fn last_block_absorbs_remainder() {
        let blocks = partition_rows(10, 3).unwrap();
        assert_eq!(
            blocks,
            vec![
                Block { row_start: 0, row_count: 3 },
                Block { row_start: 3, row_count: 3 },
                Block { row_start: 6, row_count: 4 },
            ]
        );
    }

    #[test]
    fn more_blocks_than_rows_keeps_all_rows_in_last_block() {
        let blocks = partition_rows(2, 4).unwrap();
        assert!(blocks[..3].iter().all(Block::is_empty));
        assert_eq!(blocks[3], Block { row_start: 0, row_count: 2 });
    }

    #[test]
    fn invalid_partition_input_is_rejected() {
        assert!(partition_rows(0, 4).is_err());
        assert!(partition_rows(4, 0).is_err());
    }

    #[test]
    fn view_borrows_the_right_rows() {
        let image = GrayImage::from_fn(3, 4, |x, y| image::Luma([(y * 10 + x) as u8]));
        let block = Block { row_start: 2, row_count: 2 };
        let view = block.view(&image);
        assert_eq!(view.pixels, &[20, 21, 22, 30, 31, 32]);
        assert_eq!(block.origin(), (2, 0));
    }

    #[test]
    fn raw_view_checks_buffer_length() {
        let block = Block { row_start: 0, row_count: 2 };
        assert!(BlockView::new(block, 3, &[0; 6]).is_ok());
        assert!(BlockView::new(block, 3, &[0; 5]).is_err());
    }
}
