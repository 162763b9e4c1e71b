// THEORY:
// A `DetectedObject` is the measured summary of one connected component: where it
// is, how big its bounding box is, how many pixels it has and how bright it was
// before smoothing. Like the other data containers in this crate it is immutable
// once built and has no memory of the block or image that produced it.
//
// Coordinate convention (kept from the reference detector so tables stay comparable):
// - `x_center` is a ROW index and `y_center` is a COLUMN index, both in image space.
// - `width` is the column extent of the bounding box, `height` the row extent.
//
// Objects are built by an `ObjectAccumulator`. The labeler feeds it every pixel of
// a component, already translated into image coordinates, and `finish` turns the
// running extrema and sums into the final measurements. Accumulators can be merged,
// which is how components spanning two blocks become one object.

/// Measurements of one detected object, in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    /// Floor midpoint of the bounding box's row range.
    pub x_center: u32,
    /// Floor midpoint of the bounding box's column range.
    pub y_center: u32,
    /// Inclusive column extent of the bounding box.
    pub width: u32,
    /// Inclusive row extent of the bounding box.
    pub height: u32,
    /// Number of pixels in the component.
    pub pixel_count: u64,
    /// Mean of the raw, unsmoothed intensities over the component's pixels.
    pub mean_brightness: f64,
}

/// Running bounding box and intensity sum for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAccumulator {
    min_row: u32,
    max_row: u32,
    min_col: u32,
    max_col: u32,
    pixel_count: u64,
    intensity_sum: u64,
}

impl Default for ObjectAccumulator {
    fn default() -> Self {
        Self {
            min_row: u32::MAX,
            max_row: 0,
            min_col: u32::MAX,
            max_col: 0,
            pixel_count: 0,
            intensity_sum: 0,
        }
    }
}

impl ObjectAccumulator {
    #[inline]
    pub fn add(&mut self, row: u32, col: u32, intensity: u8) {
        self.min_row = self.min_row.min(row);
        self.max_row = self.max_row.max(row);
        self.min_col = self.min_col.min(col);
        self.max_col = self.max_col.max(col);
        self.pixel_count += 1;
        self.intensity_sum += u64::from(intensity);
    }

    pub fn merge(&mut self, other: &ObjectAccumulator) {
        if other.is_empty() {
            return;
        }
        self.min_row = self.min_row.min(other.min_row);
        self.max_row = self.max_row.max(other.max_row);
        self.min_col = self.min_col.min(other.min_col);
        self.max_col = self.max_col.max(other.max_col);
        self.pixel_count += other.pixel_count;
        self.intensity_sum += other.intensity_sum;
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count == 0
    }

    /// Final measurements, or `None` if no pixel was ever added.
    pub fn finish(&self) -> Option<DetectedObject> {
        if self.is_empty() {
            return None;
        }
        Some(DetectedObject {
            x_center: midpoint(self.min_row, self.max_row),
            y_center: midpoint(self.min_col, self.max_col),
            width: self.max_col - self.min_col + 1,
            height: self.max_row - self.min_row + 1,
            pixel_count: self.pixel_count,
            mean_brightness: self.intensity_sum as f64 / self.pixel_count as f64,
        })
    }
}

#[inline]
fn midpoint(min: u32, max: u32) -> u32 {
    ((u64::from(min) + u64::from(max)) / 2) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_accumulator_yields_nothing() {
        assert!(ObjectAccumulator::default().finish().is_none());
    }

    #[test]
    fn single_pixel_object() {
        let mut acc = ObjectAccumulator::default();
        acc.add(7, 3, 180);
        let object = acc.finish().unwrap();
        assert_eq!(
            object,
            DetectedObject {
                x_center: 7,
                y_center: 3,
                width: 1,
                height: 1,
                pixel_count: 1,
                mean_brightness: 180.0,
            }
        );
    }

    #[test]
    fn bounding_box_uses_floor_midpoint_and_inclusive_extent() {
        let mut acc = ObjectAccumulator::default();
        // Rows 2..=5, columns 10..=12.
        acc.add(2, 10, 100);
        acc.add(5, 12, 200);
        acc.add(3, 11, 150);
        let object = acc.finish().unwrap();
        assert_eq!(object.x_center, 3);
        assert_eq!(object.y_center, 11);
        assert_eq!(object.height, 4);
        assert_eq!(object.width, 3);
        assert_eq!(object.pixel_count, 3);
        assert_eq!(object.mean_brightness, 150.0);
    }

    #[test]
    fn merge_combines_extents_and_sums() {
        let mut top = ObjectAccumulator::default();
        top.add(3, 4, 200);
        top.add(3, 5, 200);
        let mut bottom = ObjectAccumulator::default();
        bottom.add(4, 5, 100);

        top.merge(&bottom);
        top.merge(&ObjectAccumulator::default());
        let object = top.finish().unwrap();
        assert_eq!(object.height, 2);
        assert_eq!(object.width, 2);
        assert_eq!(object.pixel_count, 3);
        assert!((object.mean_brightness - 500.0 / 3.0).abs() < 1e-12);
    }
}
