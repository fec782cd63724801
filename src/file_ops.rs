//! Filesystem port: safe file moves into routing directories.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

/// Move `src` into `dst_dir` under `target_name`, creating the directory
/// if needed.
///
/// The target name is normalized to its base name (path separators in a
/// crafted name cannot escape the directory), and the resolved destination
/// is verified to stay inside `dst_dir`. Existing files are never
/// overwritten; collisions get a `_1`, `_2`, ... suffix.
pub fn safe_move(src: &Path, dst_dir: &Path, target_name: &str) -> Result<PathBuf> {
    let normalized = normalize_name(target_name, src);
    std::fs::create_dir_all(dst_dir)
        .with_context(|| format!("Failed to create {}", dst_dir.display()))?;

    let dst = dst_dir.join(&normalized);

    // Re-check containment on the resolved path; a name that normalizes to
    // "." or sneaks a separator past the base-name step must be rejected.
    let dir_resolved = dst_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dst_dir.display()))?;
    let parent_resolved = dst
        .parent()
        .map(Path::canonicalize)
        .transpose()?
        .unwrap_or_default();
    if parent_resolved != dir_resolved {
        bail!(
            "destination {} escapes target directory {}",
            dst.display(),
            dst_dir.display()
        );
    }

    let dst = dedupe_destination(&dst);
    std::fs::rename(src, &dst).or_else(|_| {
        // Cross-device moves (inbox and output on different mounts) fall
        // back to copy + remove.
        std::fs::copy(src, &dst)
            .and_then(|_| std::fs::remove_file(src))
            .map(|_| ())
    })?;
    Ok(dst)
}

fn normalize_name(target_name: &str, src: &Path) -> String {
    let cleaned = target_name.replace('\\', "/");
    let base = Path::new(&cleaned)
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .last()
        .map(str::trim)
        .unwrap_or("");
    if base.is_empty() {
        src.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string()
    } else {
        base.to_string()
    }
}

fn dedupe_destination(dst: &Path) -> PathBuf {
    if !dst.exists() {
        return dst.to_path_buf();
    }
    let stem = dst
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed");
    let ext = dst.extension().and_then(|s| s.to_str());
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    for i in 1.. {
        let name = match ext {
            Some(e) => format!("{}_{}.{}", stem, i, e),
            None => format!("{}_{}", stem, i),
        };
        let cand = dir.join(name);
        if !cand.exists() {
            return cand;
        }
    }
    unreachable!()
}
