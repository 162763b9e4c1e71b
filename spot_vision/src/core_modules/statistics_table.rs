// THEORY:
// The `StatisticsTable` is the one piece of mutable state shared by every worker in
// a batch: an append-only CSV file with one row per detected object.
//
// Key principles:
// 1.  **Header Once**: `create` truncates the file and writes the header. It runs in
//     the dispatcher's setup phase, before any worker exists. Workers only append.
// 2.  **Atomic Appends**: All rows for one image are formatted into a single buffer
//     first, then written with one `write_all` while holding the table's mutex. A
//     reader can see a whole image's rows or none of them, never a torn row.
// 3.  **Reference Format**: CRLF record terminators, minimal quoting, and brightness
//     in its shortest round-trip form, so tables diff cleanly against the
//     reference tool's output.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core_modules::annotation::brightness_label;
use crate::core_modules::detected_object::DetectedObject;
use crate::error::{Result, SpotError};

pub const STATISTICS_FILE_NAME: &str = "statistics.csv";
pub const HEADER: [&str; 7] = [
    "Image",
    "X Center",
    "Y Center",
    "Width",
    "Height",
    "Size",
    "Brightness",
];

const RECORD_TERMINATOR: &str = "\r\n";

/// Shared, append-only per-object results file.
#[derive(Debug)]
pub struct StatisticsTable {
    path: PathBuf,
    file: Mutex<File>,
}

impl StatisticsTable {
    /// Truncates (or creates) `<output_dir>/statistics.csv` and writes the header.
    pub fn create(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(STATISTICS_FILE_NAME);

        let mut header = String::new();
        push_record(&mut header, HEADER.iter().map(|h| h.to_string()));
        std::fs::write(&path, header.as_bytes()).map_err(|e| SpotError::io(&path, e))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| SpotError::io(&path, e))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row per object for `image_name`. Returns the number of rows written.
    pub fn append(&self, image_name: &str, objects: &[DetectedObject]) -> Result<usize> {
        self.append_if(image_name, objects, || true)
            .map(|written| written.unwrap_or(0))
    }

    /// Like `append`, but `commit` runs under the table lock right before the write.
    /// When it returns `false` nothing is written and the result is `Ok(None)`.
    pub fn append_if(
        &self,
        image_name: &str,
        objects: &[DetectedObject],
        commit: impl FnOnce() -> bool,
    ) -> Result<Option<usize>> {
        let rows = format_rows(image_name, objects);

        let mut file = self.file.lock();
        if !commit() {
            return Ok(None);
        }
        if rows.is_empty() {
            return Ok(Some(0));
        }
        file.write_all(rows.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| SpotError::io(&self.path, e))?;
        Ok(Some(objects.len()))
    }
}

/// Formats the rows for one image, in header column order.
pub fn format_rows(image_name: &str, objects: &[DetectedObject]) -> String {
    let mut out = String::with_capacity(objects.len() * 48);
    for object in objects {
        push_record(
            &mut out,
            [
                image_name.to_string(),
                object.x_center.to_string(),
                object.y_center.to_string(),
                object.width.to_string(),
                object.height.to_string(),
                object.pixel_count.to_string(),
                brightness_label(object.mean_brightness),
            ],
        );
    }
    out
}

fn push_record(out: &mut String, fields: impl IntoIterator<Item = String>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_field(out, &field);
    }
    out.push_str(RECORD_TERMINATOR);
}

fn push_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\r', '\n']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}
