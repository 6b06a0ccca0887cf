//! The crate's operational surface: `build_index`, `open_editor`,
//! `run_query`. Everything else in this crate is a building block these
//! three entry points assemble; a caller (the demonstration CLI, or any
//! future GUI shell) only needs to reach for this module.
//!
//! `open_editor` returns a [Dataset] handle rather than a bare
//! [crate::query::engine::QueryEngine] so that settings loaded once when
//! a dataset is opened travel with every later query against it, instead
//! of being re-read or re-guessed on each call.

use crate::builder::{BuilderStatus, IndexBuilder};
use crate::chunk::Chunk;
use crate::error::CoreError;
use crate::octree::sidecar::read_octree;
use crate::octree::NodeId;
use crate::point::file::side_stream_path;
use crate::point::{PointFile, PointRecord, SideAttributes, SideStream};
use crate::query::engine::QueryEngine;
use crate::query::QueryWhere;
use crate::settings::Settings;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Blocking convenience wrapper around [IndexBuilder]: drives a build to
/// completion in one call, for callers (tests, a synchronous CLI
/// invocation) that have no need to interleave progress reporting with
/// anything else. Equivalent to constructing an [IndexBuilder] and
/// calling [IndexBuilder::run_to_completion] directly.
pub fn build_index(
    input_path: impl Into<PathBuf>,
    data_dir: impl AsRef<Path>,
    settings: Settings,
) -> Result<(), CoreError> {
    let mut builder = IndexBuilder::new(settings, input_path, data_dir)?;
    builder.run_to_completion()
}

/// Begins (or resumes reporting progress on) an index build without
/// blocking until completion. The caller drives it forward with repeated
/// [IndexBuilder::next] calls, each bounded by a deadline, and polls
/// [IndexBuilder::percent] between them - the shape the builder's state
/// machine is designed around.
pub fn build_index_incremental(
    input_path: impl Into<PathBuf>,
    data_dir: impl AsRef<Path>,
    settings: Settings,
) -> Result<IndexBuilder, CoreError> {
    IndexBuilder::new(settings, input_path, data_dir)
}

/// A single, already-built dataset opened for querying: its compiled
/// coarse octree, point file, attribute side-stream, and the page cache
/// shared by every query run against it. Exclusive access is enforced by
/// the ordinary `&mut self` borrow checker rather than a runtime lock,
/// since only one query or build ever touches a dataset at a time (see
/// DESIGN.md's Open Question on this).
pub struct Dataset {
    data_dir: PathBuf,
    settings: Settings,
    engine: QueryEngine,
}

impl Dataset {
    /// Opens a dataset previously produced by [build_index] at
    /// `data_dir`, loading its settings and compiled octree but none of
    /// its pages - those are loaded lazily, on demand, by the page
    /// cache inside [QueryEngine].
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let data_dir = data_dir.as_ref().to_owned();
        let settings = Settings::load_from_data_folder(&data_dir)
            .unwrap_or_default();

        let points_path = data_dir.join("points.las");
        let sidecar_path = data_dir.join("index.sidecar");

        let points = PointFile::open(&points_path)?;
        let sides = SideStream::open(side_stream_path(&points_path, "side"))?;

        let sidecar_bytes = std::fs::read(&sidecar_path).map_err(|e| CoreError::io(&sidecar_path, e))?;
        let chunk = Chunk::read_from(&sidecar_path, sidecar_bytes.as_slice())?;
        let octree = read_octree(&sidecar_path, &chunk)?;

        let engine = QueryEngine::new(octree, points, sides, settings.cache_bytes);
        Ok(Dataset {
            data_dir,
            settings,
            engine,
        })
    }

    /// Multi-dataset convenience: opens every path in `dataset_paths` for
    /// simultaneous querying. Each dataset keeps its own cache sized by
    /// its own `settings.json` rather than splitting one shared budget
    /// across them - a single shared budget would need a cross-dataset
    /// eviction ordering this crate's per-dataset [QueryEngine] does not
    /// implement (see DESIGN.md Open Question).
    pub fn open_editor(dataset_paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Result<Vec<Self>, CoreError> {
        dataset_paths.into_iter().map(Self::open).collect()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn engine(&mut self) -> &mut QueryEngine {
        &mut self.engine
    }

    /// Writes back every dirty cached page so edits made through
    /// [run_modify] are durable without having to wait for eviction.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        self.engine.flush()
    }
}

/// Runs `where_` against `dataset`, calling `modifier` on the side
/// attributes of every matching point - see
/// [crate::query::engine::QueryEngine::run_modify]. Returns the number
/// of points touched. The edit is cached but not guaranteed durable
/// until [Dataset::flush].
pub fn run_modify(
    dataset: &mut Dataset,
    where_: &QueryWhere,
    modifier: impl FnMut(&PointRecord, &mut SideAttributes),
) -> Result<usize, CoreError> {
    dataset.engine.run_modify(where_, modifier)
}

/// One matching point, with enough identifying information for a caller
/// to look up any further per-point field it needs.
#[derive(Debug, Clone, Copy)]
pub struct QueryMatch {
    pub page: NodeId,
    pub ordinal: u64,
    pub point: PointRecord,
    pub attributes: SideAttributes,
}

/// Runs `where_` against `dataset` and invokes `callback` once per
/// matching point, in the order [QueryEngine::run] produces them.
/// Callers wanting per-page granularity instead should drive
/// [QueryEngine::run] (or `run_capped`) directly and read back whole
/// pages via the cache.
pub fn run_query(
    dataset: &mut Dataset,
    where_: &QueryWhere,
    callback: impl FnMut(QueryMatch),
) -> Result<usize, CoreError> {
    run_query_capped(dataset, where_, None, callback)
}

/// As [run_query], but stops once `maximum_results` points have been
/// delivered to `callback`.
pub fn run_query_capped(
    dataset: &mut Dataset,
    where_: &QueryWhere,
    maximum_results: Option<usize>,
    mut callback: impl FnMut(QueryMatch),
) -> Result<usize, CoreError> {
    let matches = dataset.engine.run_capped(where_, maximum_results)?;
    let mut count = 0;
    for (page, ordinal) in matches {
        let point = dataset.engine.points_mut().read_point(ordinal)?;
        let attributes = dataset.engine.sides_mut().read(ordinal)?;
        callback(QueryMatch {
            page,
            ordinal,
            point,
            attributes,
        });
        count += 1;
    }
    Ok(count)
}

/// Drives one [IndexBuilder] to completion, calling `on_progress` after
/// every step so a caller can update a progress bar without busy-waiting
/// a much finer-grained polling loop than the builder's own per-state
/// time budget already provides.
pub fn build_index_with_progress(
    mut builder: IndexBuilder,
    step_budget: Duration,
    mut on_progress: impl FnMut(BuilderStatus),
) -> Result<(), CoreError> {
    loop {
        let status = builder.next(Instant::now() + step_budget)?;
        on_progress(status);
        if status.state == crate::builder::BuilderState::Done {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::RegionShape;
    use las::point::Format as LasFormat;
    use las::raw::point::{Flags, ScanAngle};
    use las::raw::{Header, Point as RawPoint};
    use nalgebra::Point3;
    use std::fs::File;

    fn write_test_las(path: &Path, points: &[Point3<f64>]) {
        let mut header = Header::default();
        header.version = las::Version::new(1, 2);
        header.point_data_record_format = 3;
        header.point_data_record_length = crate::point::format::PointFormat(3).record_length().unwrap();
        header.header_size = header.version.header_size();
        header.offset_to_point_data = header.header_size as u32;
        header.x_scale_factor = 0.001;
        header.y_scale_factor = 0.001;
        header.z_scale_factor = 0.001;
        header.number_of_point_records = points.len() as u32;
        header.number_of_points_by_return = [points.len() as u32, 0, 0, 0, 0];

        let mut file = File::create(path).unwrap();
        header.clone().write_to(&mut file).unwrap();
        let format = LasFormat::new(3).unwrap();
        for position in points {
            let raw = RawPoint {
                x: (position.x / header.x_scale_factor).round() as i32,
                y: (position.y / header.y_scale_factor).round() as i32,
                z: (position.z / header.z_scale_factor).round() as i32,
                intensity: 100,
                flags: Flags::TwoByte(0b0010_0000, 2),
                scan_angle: ScanAngle::Rank(0),
                ..Default::default()
            };
            raw.write_to(&mut file, &format).unwrap();
        }
    }

    /// Scenario (a): a two-point file, queried against a box enclosing
    /// only the first point.
    #[test]
    fn two_point_box_query_returns_only_the_enclosed_point() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.las");
        write_test_las(&input, &[Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0)]);

        let data_dir = dir.path().join("index");
        build_index(input, &data_dir, Settings::default()).unwrap();

        let mut dataset = Dataset::open(&data_dir).unwrap();
        let where_ = QueryWhere {
            region: RegionShape::Box(test_box()),
            ..QueryWhere::default()
        };
        let mut found = Vec::new();
        let count = run_query(&mut dataset, &where_, |m| found.push(m.point.position)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(found[0], Point3::new(0.0, 0.0, 0.0));
    }

    fn test_box() -> crate::geometry::bounding_box::Aabb {
        crate::geometry::bounding_box::Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0))
    }

    /// Scenario (d): a modification made through `run_modify` survives a
    /// flush and a fresh reopen, and only the points it actually touched
    /// carry the new segment id. A tiny `max_index_l1_size` forces the
    /// five points across more than one page, so this also exercises
    /// write-back across multiple cached pages at once.
    #[test]
    fn segment_modification_survives_reopen_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.las");
        let points: Vec<Point3<f64>> = (0..5).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        write_test_las(&input, &points);

        let data_dir = dir.path().join("index");
        let settings = Settings {
            max_index_l1_size: 2,
            ..Settings::default()
        };
        build_index(input, &data_dir, settings).unwrap();

        {
            let mut dataset = Dataset::open(&data_dir).unwrap();
            let where_ = QueryWhere {
                region: RegionShape::Box(crate::geometry::bounding_box::Aabb::new(
                    Point3::new(2.5, -1.0, -1.0),
                    Point3::new(10.0, 1.0, 1.0),
                )),
                ..QueryWhere::default()
            };
            let touched = run_modify(&mut dataset, &where_, |_point, attrs| {
                attrs.segment_id = 42;
            })
            .unwrap();
            assert_eq!(touched, 2, "only x=3 and x=4 fall inside the modify region");
            dataset.flush().unwrap();
        }

        let mut reopened = Dataset::open(&data_dir).unwrap();
        let mut segmented = Vec::new();
        let where_ = QueryWhere {
            segment: crate::query::RangeFilter::new(42..=42),
            ..QueryWhere::default()
        };
        run_query(&mut reopened, &where_, |m| segmented.push(m.point.position.x)).unwrap();
        segmented.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(segmented, vec![3.0, 4.0]);
    }
}
