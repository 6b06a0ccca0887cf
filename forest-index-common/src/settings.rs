//! Persisted index settings: the knobs chosen once at `init` time that
//! then govern every later `build`, stored as `settings.json` alongside
//! the index sidecar and point files.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Where a point's color should come from when the source file offers
/// more than one candidate (e.g. both a native LAS color and a computed
/// one); kept as an explicit enum rather than a priority list since the
/// index only ever stores one color per point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSource {
    /// Use the point's native LAS RGB fields, if present.
    Native,
    /// Synthesize a greyscale color from intensity.
    Intensity,
}

impl Default for ColorSource {
    fn default() -> Self {
        ColorSource::Native
    }
}

/// Settings chosen once when an index folder is initialized, and
/// consulted by every subsequent `build`/`query` invocation against that
/// folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Randomize point order within a page before it is persisted
    /// (de-correlates scan-line artifacts in viewers that subsample).
    #[serde(default)]
    pub randomize_points: bool,

    /// Upgrade every point to LAS format version 1.4 (extended) during
    /// indexing, regardless of the source file's format.
    #[serde(default)]
    pub convert_to_version_1_4: bool,

    /// Preserve a source point's extra bytes beyond its format's fixed
    /// fields, round-tripping them unmodified.
    #[serde(default)]
    pub copy_extra_bytes: bool,

    /// Maximum number of points a coarse (page-level, "L1") node may
    /// hold before it overflows into children.
    pub max_index_l1_size: u64,

    /// Maximum coarse octree depth.
    pub max_index_l1_level: u32,

    /// Maximum number of points a fine, in-page ("L2") node may hold.
    pub max_index_l2_size: u64,

    /// Maximum fine, in-page octree depth.
    pub max_index_l2_level: u32,

    /// Number of points buffered in memory per builder pass before being
    /// flushed to disk.
    pub buffer_size: usize,

    /// Byte budget for the page cache.
    pub cache_bytes: u64,

    #[serde(default)]
    pub color_source: ColorSource,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            randomize_points: false,
            convert_to_version_1_4: true,
            copy_extra_bytes: false,
            max_index_l1_size: 50_000,
            max_index_l1_level: 12,
            max_index_l2_size: 10_000,
            max_index_l2_level: 8,
            buffer_size: 1 << 20,
            cache_bytes: 512 * 1024 * 1024,
            color_source: ColorSource::Native,
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsIoError {
    #[error("io error while accessing settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing settings file: {0}")]
    SerDe(#[from] serde_json::Error),
}

const SETTINGS_FILE_NAME: &str = "settings.json";

fn settings_file_in(data_folder: &Path) -> PathBuf {
    data_folder.join(SETTINGS_FILE_NAME)
}

impl Settings {
    pub fn load_from_file(file: impl AsRef<Path>) -> Result<Self, SettingsIoError> {
        let reader = BufReader::new(File::open(file)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn load_from_data_folder(data_folder: impl AsRef<Path>) -> Result<Self, SettingsIoError> {
        Self::load_from_file(settings_file_in(data_folder.as_ref()))
    }

    pub fn save_to_file(&self, file: impl AsRef<Path>) -> Result<(), SettingsIoError> {
        let writer = BufWriter::new(File::create(file)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn save_to_data_folder(&self, data_folder: impl AsRef<Path>) -> Result<(), SettingsIoError> {
        self.save_to_file(settings_file_in(data_folder.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_index_l1_size: 123,
            ..Settings::default()
        };
        settings.save_to_data_folder(dir.path()).unwrap();
        let loaded = Settings::load_from_data_folder(dir.path()).unwrap();
        assert_eq!(settings, loaded);
    }

    #[test]
    fn default_color_source_is_native() {
        assert_eq!(Settings::default().color_source, ColorSource::Native);
    }
}
