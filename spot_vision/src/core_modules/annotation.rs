// THEORY:
// Annotation produces a copy of the source image for a person to check by eye:
// every detected object gets a rectangle outline and its mean brightness written
// next to it. The analyzer's image is never touched. Drawing happens on a clone
// owned by the renderer.
//
// Geometry follows the reference renderer pixel for pixel:
// - The outline spans columns `y_center ± width / 2` and rows `x_center ± height / 2`
//   (integer halving), drawn 2 px thick toward the inside.
// - The label's top-left corner sits at column `y_center + 5`, row `x_center - 10`.
// - The canvas is single-channel, so the outline uses the luma of pure red (76) and
//   the text is white.
//
// Text uses a 3x5 bitmap font covering exactly the characters a brightness label
// can contain. Anything that falls off the image is clipped.

use image::{GrayImage, Luma};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::core_modules::detected_object::DetectedObject;

pub const OUTLINE_LUMA: Luma<u8> = Luma([76]);
pub const LABEL_LUMA: Luma<u8> = Luma([255]);
pub const OUTLINE_THICKNESS: i64 = 2;

const LABEL_OFFSET_COLUMNS: i64 = 5;
const LABEL_OFFSET_ROWS: i64 = -10;

const GLYPH_WIDTH: i64 = 3;
const GLYPH_HEIGHT: i64 = 5;
const GLYPH_ADVANCE: i64 = GLYPH_WIDTH + 1;

#[rustfmt::skip]
static DIGITS: [[u8; 15]; 10] = [
    [1, 1, 1, 1, 0, 1, 1, 0, 1, 1, 0, 1, 1, 1, 1], // 0
    [0, 1, 0, 1, 1, 0, 0, 1, 0, 0, 1, 0, 1, 1, 1], // 1
    [1, 1, 1, 0, 0, 1, 1, 1, 1, 1, 0, 0, 1, 1, 1], // 2
    [1, 1, 1, 0, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 3
    [1, 0, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 0, 0, 1], // 4
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 5
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 1, 0, 1, 1, 1, 1], // 6
    [1, 1, 1, 0, 0, 1, 0, 0, 1, 0, 0, 1, 0, 0, 1], // 7
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 1, 1, 1], // 8
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 9
];
#[rustfmt::skip]
static DOT: [u8; 15] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0];
#[rustfmt::skip]
static MINUS: [u8; 15] = [0, 0, 0, 0, 0, 0, 1, 1, 1, 0, 0, 0, 0, 0, 0];

/// Text drawn next to an object: the shortest decimal that round-trips its mean
/// brightness, e.g. `200.0` or `143.25`.
pub fn brightness_label(mean_brightness: f64) -> String {
    format!("{mean_brightness:?}")
}

/// Returns a copy of `image` with every object outlined and labeled.
pub fn render_annotations(image: &GrayImage, objects: &[DetectedObject]) -> GrayImage {
    let mut canvas = image.clone();
    for object in objects {
        draw_outline(&mut canvas, object);
        let row = i64::from(object.x_center) + LABEL_OFFSET_ROWS;
        let column = i64::from(object.y_center) + LABEL_OFFSET_COLUMNS;
        draw_text(&mut canvas, column, row, &brightness_label(object.mean_brightness));
    }
    canvas
}

/// Outline corners as `(left, top, right, bottom)`, inclusive.
pub fn outline_bounds(object: &DetectedObject) -> (i64, i64, i64, i64) {
    let row = i64::from(object.x_center);
    let column = i64::from(object.y_center);
    let half_width = i64::from(object.width) / 2;
    let half_height = i64::from(object.height) / 2;
    (
        column - half_width,
        row - half_height,
        column + half_width,
        row + half_height,
    )
}

fn draw_outline(canvas: &mut GrayImage, object: &DetectedObject) {
    let (left, top, right, bottom) = outline_bounds(object);
    for inset in 0..OUTLINE_THICKNESS {
        let (l, t, r, b) = (left + inset, top + inset, right - inset, bottom - inset);
        if r < l || b < t {
            break;
        }
        let rect = Rect::at(l as i32, t as i32).of_size((r - l + 1) as u32, (b - t + 1) as u32);
        draw_hollow_rect_mut(canvas, rect, OUTLINE_LUMA);
    }
}

fn glyph(c: char) -> Option<&'static [u8; 15]> {
    match c {
        '0'..='9' => Some(&DIGITS[c as usize - '0' as usize]),
        '.' => Some(&DOT),
        '-' => Some(&MINUS),
        _ => None,
    }
}

fn draw_text(canvas: &mut GrayImage, left: i64, top: i64, text: &str) {
    let (width, height) = (i64::from(canvas.width()), i64::from(canvas.height()));
    for (index, c) in text.chars().enumerate() {
        let Some(bits) = glyph(c) else { continue };
        let origin_x = left + index as i64 * GLYPH_ADVANCE;
        for row in 0..GLYPH_HEIGHT {
            for col in 0..GLYPH_WIDTH {
                if bits[(row * GLYPH_WIDTH + col) as usize] == 0 {
                    continue;
                }
                let (x, y) = (origin_x + col, top + row);
                if (0..width).contains(&x) && (0..height).contains(&y) {
                    canvas.put_pixel(x as u32, y as u32, LABEL_LUMA);
                }
            }
        }
    }
}
