//! Archive extraction and script discovery.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{HostError, HostResult};

/// Extract a zip archive held in memory into `dest`, replacing any existing directory.
/// Entries whose names would escape `dest` are rejected.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> HostResult<()> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| HostError::Archive(e.to_string()))?;

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let result = (0..archive.len()).try_for_each(|i| {
        let mut file = archive
            .by_index(i)
            .map_err(|e| HostError::Archive(e.to_string()))?;
        let relative = file
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| HostError::Archive(format!("unsafe entry name: {}", file.name())))?;
        let out_path = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            return Ok(());
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out_file)?;
        Ok(())
    });

    if result.is_err() {
        let _ = fs::remove_dir_all(dest);
    }
    result
}

/// Every `.py` file under `project_dir`, as sorted `/`-separated paths relative to it.
pub fn python_scripts(project_dir: &Path) -> Vec<String> {
    let mut scripts: Vec<String> = walkdir::WalkDir::new(project_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "py"))
        .filter_map(|e| {
            e.path()
                .strip_prefix(project_dir)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    scripts.sort();
    scripts
}

/// Resolve a user-typed script name against the project directory. Names that climb out
/// of the directory never resolve.
pub fn resolve_script(project_dir: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return None;
    }
    let path = project_dir.join(rel);
    path.is_file().then_some(path)
}
