//! Discovery of the artifacts each stage is expected to produce.
//!
//! Nerfstudio nests its outputs (`<out>/<experiment>/<method>/<timestamp>/`),
//! so lookups walk the stage output directory recursively.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::stage::StageKind;

/// Camera poses written by `ns-process-data`.
pub const TRANSFORMS_FILE: &str = "transforms.json";

/// Trained model config written by `ns-train`; input to `ns-export`.
pub const TRAIN_CONFIG_FILE: &str = "config.yml";

/// Extension of the exported point cloud.
pub const POINT_CLOUD_EXTENSION: &str = "ply";

static CHECKPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^step-(\d+)\.ckpt$").expect("valid regex"));

/// Locate the declared artifacts of `kind` under `output_dir`.
///
/// Returns the paths in a fixed order:
/// - SfM: `[transforms.json]`
/// - training: `[config.yml, latest step-*.ckpt]`
/// - packaging: `[*.ply]`
///
/// On failure, returns a description of what is missing.
pub fn discover(kind: StageKind, output_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let missing = |what: &str| format!("expected {what} under {}", output_dir.display());

    match kind {
        StageKind::StructureFromMotion => {
            let transforms = find_named(output_dir, TRANSFORMS_FILE)
                .ok_or_else(|| missing(TRANSFORMS_FILE))?;
            Ok(vec![transforms])
        }
        StageKind::NeuralFieldTraining => {
            let config =
                find_named(output_dir, TRAIN_CONFIG_FILE).ok_or_else(|| missing(TRAIN_CONFIG_FILE))?;
            let (_, checkpoint) =
                latest_checkpoint(output_dir).ok_or_else(|| missing("a step-*.ckpt checkpoint"))?;
            Ok(vec![config, checkpoint])
        }
        StageKind::Packaging => {
            let ply = find_by_extension(output_dir, POINT_CLOUD_EXTENSION)
                .ok_or_else(|| missing("a .ply point cloud"))?;
            Ok(vec![ply])
        }
    }
}

/// First file called `name` under `root`, shallowest first.
pub fn find_named(root: &Path, name: &str) -> Option<PathBuf> {
    walk(root)
        .into_iter()
        .find(|p| p.file_name().is_some_and(|n| n == name))
}

/// First non-empty file with extension `ext` under `root`, shallowest first.
pub fn find_by_extension(root: &Path, ext: &str) -> Option<PathBuf> {
    walk(root).into_iter().find(|p| {
        p.extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(ext))
            && std::fs::metadata(p).is_ok_and(|m| m.len() > 0)
    })
}

/// The `step-N.ckpt` with the highest `N` under `root`.
pub fn latest_checkpoint(root: &Path) -> Option<(u64, PathBuf)> {
    walk(root)
        .into_iter()
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?;
            let step = CHECKPOINT_RE.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((step, p))
        })
        .max_by_key(|(step, _)| *step)
}

/// All regular files under `root`, breadth first, sorted within a level.
fn walk(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut level = vec![root.to_path_buf()];

    while !level.is_empty() {
        let mut next = Vec::new();
        let mut here = Vec::new();
        for dir in level {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    next.push(entry.path());
                } else if file_type.is_file() {
                    here.push(entry.path());
                }
            }
        }
        here.sort();
        next.sort();
        files.extend(here);
        level = next;
    }
    files
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
