//! Upload validation rules.
//!
//! A submission points at a directory of images. It is accepted only if the
//! directory holds enough images whose headers decode; anything else is an
//! input error and never reaches the queue.

use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// File extensions accepted as input images (lowercase).
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Structure from motion needs a reasonable amount of overlap to converge.
pub const DEFAULT_MIN_IMAGES: usize = 10;

/// A validated set of input images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub dir: PathBuf,
    /// Image paths, sorted by file name.
    pub images: Vec<PathBuf>,
}

impl ImageSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Whether `path` has one of the [`SUPPORTED_IMAGE_EXTENSIONS`].
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Scan `dir` and validate it as a reconstruction input.
///
/// Hidden files, subdirectories and files with other extensions are
/// ignored. Every candidate image must have a decodable header.
pub fn scan_image_set(dir: &Path, min_images: usize) -> Result<ImageSet, CoreError> {
    if !dir.is_dir() {
        return Err(CoreError::Validation(format!(
            "Input '{}' is not a directory",
            dir.display()
        )));
    }

    let entries = std::fs::read_dir(dir).map_err(|e| {
        CoreError::Validation(format!("Cannot read input '{}': {e}", dir.display()))
    })?;

    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            CoreError::Validation(format!("Cannot read input '{}': {e}", dir.display()))
        })?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !path.is_file() || !is_supported_image(&path) {
            continue;
        }
        probe_dimensions(&path)?;
        images.push(path);
    }

    if images.len() < min_images {
        return Err(CoreError::Validation(format!(
            "Input '{}' contains {} images, at least {min_images} are required",
            dir.display(),
            images.len()
        )));
    }

    images.sort();
    Ok(ImageSet {
        dir: dir.to_path_buf(),
        images,
    })
}

/// Read only the image header and return `(width, height)`.
pub fn probe_dimensions(path: &Path) -> Result<(u32, u32), CoreError> {
    let invalid = |e: String| {
        CoreError::Validation(format!("Unreadable image '{}': {e}", path.display()))
    };
    image::ImageReader::open(path)
        .map_err(|e| invalid(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| invalid(e.to_string()))?
        .into_dimensions()
        .map_err(|e| invalid(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn write_png(dir: &Path, name: &str) {
        image::RgbImage::new(8, 6)
            .save(dir.join(name))
            .expect("write png");
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(is_supported_image(Path::new("a/frame_0001.JPG")));
        assert!(is_supported_image(Path::new("b.png")));
        assert!(!is_supported_image(Path::new("c.mp4")));
        assert!(!is_supported_image(Path::new("noext")));
    }

    #[test]
    fn accepts_enough_images_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in (0..12).rev() {
            write_png(dir.path(), &format!("frame_{i:04}.png"));
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let set = scan_image_set(dir.path(), 10).expect("valid set");
        assert_eq!(set.len(), 12);
        assert!(set.images[0].ends_with("frame_0000.png"));
        assert!(set.images[11].ends_with("frame_0011.png"));
    }

    #[test]
    fn rejects_too_few_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..3 {
            write_png(dir.path(), &format!("{i}.png"));
        }
        let err = scan_image_set(dir.path(), 10).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("contains 3 images"));
    }

    #[test]
    fn rejects_corrupt_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(dir.path(), "ok.png");
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").expect("write");
        let err = scan_image_set(dir.path(), 1).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("broken.jpg"));
    }

    #[test]
    fn rejects_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = scan_image_set(&dir.path().join("nope"), 1).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("not a directory"));
    }

    #[test]
    fn probe_reads_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(dir.path(), "one.png");
        assert_eq!(probe_dimensions(&dir.path().join("one.png")).expect("probe"), (8, 6));
    }
}
