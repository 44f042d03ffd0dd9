//! Destination paths for retrieved composite objects

use std::path::{Component, Path, PathBuf};

use crate::error::{DimseError, Result};
use crate::types::trim_uid;

/// Provides the root directory of the local image cache
pub trait CacheRoot: Send + Sync {
    fn cache_root(&self) -> &Path;
}

impl CacheRoot for PathBuf {
    fn cache_root(&self) -> &Path {
        self.as_path()
    }
}

/// Build `<cache_root>/<study>/<series>/<file_name>`, creating the study and
/// series directories when they do not exist yet.
///
/// Calling it again with the same arguments returns the same path.
pub fn resolve(
    study_instance_uid: &str,
    series_instance_uid: &str,
    file_name: &str,
    cache_root: &Path,
) -> Result<PathBuf> {
    let study = path_component("Study Instance UID", study_instance_uid)?;
    let series = path_component("Series Instance UID", series_instance_uid)?;
    let file_name = path_component("file name", file_name)?;

    let study_dir = cache_root.join(study);
    ensure_dir(&study_dir)?;

    let series_dir = study_dir.join(series);
    ensure_dir(&series_dir)?;

    Ok(series_dir.join(file_name))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    match std::fs::create_dir(dir) {
        Ok(()) => Ok(()),
        // another retrieve created it in the meantime
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(DimseError::storage(format!(
            "could not create directory {}: {}",
            dir.display(),
            e
        ))),
    }
}

fn path_component<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    let value = trim_uid(value);
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !value.contains(&['/', '\\'][..]) => Ok(value),
        _ => Err(DimseError::storage(format!(
            "{} {:?} is not usable as a path component",
            what, value
        ))),
    }
}
