use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tracing::info;
use walkdir::WalkDir;

use crate::ml::engine::ModelKind;

const SEARCH_DEPTH: usize = 5;

/// Finds the `.onnx` file for `model`.
///
/// Order: the explicit path if one was configured, `$U2NET_HOME`,
/// `~/.u2net`, then a bounded search below the working directory and its
/// parent.
pub fn resolve_model_path(model: ModelKind, explicit: Option<&Path>) -> Result<PathBuf> {
    let root = env::current_dir()?;
    resolve_in(model, explicit, &model_home_dirs(), &root)
}

fn model_home_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os("U2NET_HOME") {
        dirs.push(PathBuf::from(dir));
    }
    if let Some(home) = env::var_os("HOME") {
        dirs.push(PathBuf::from(home).join(".u2net"));
    }
    dirs
}

fn resolve_in(
    model: ModelKind,
    explicit: Option<&Path>,
    home_dirs: &[PathBuf],
    search_root: &Path,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(anyhow!("Model file not found: {}", path.display()));
    }

    let file_name = model.file_name();
    for dir in home_dirs {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            info!("Found {} model: {:?}", model, candidate);
            return Ok(candidate);
        }
    }

    info!("{} not in model home directories. Searching filesystem...", file_name);
    let found = find_file(&file_name, search_root, SEARCH_DEPTH)?;
    info!("Found {} model: {:?}", model, found);
    Ok(found)
}

fn find_file(filename: &str, root: &Path, max_depth: usize) -> Result<PathBuf> {
    let search = |dir: &Path| {
        WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == filename)
            .map(|e| e.path().to_path_buf())
    };

    if let Some(path) = search(root) {
        return Ok(path);
    }

    // Running from a subdirectory of the deployment is common enough to look one level up.
    if let Some(path) = root.parent().and_then(search) {
        return Ok(path);
    }

    Err(anyhow!("Could not find model file '{}' in nearby directories.", filename))
}
