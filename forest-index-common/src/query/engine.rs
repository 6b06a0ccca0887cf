//! Ties the octree, page cache, and point/side storage together into a
//! single `run` call: prune pages by region, load (or reuse) each
//! surviving page, evaluate the predicate, and collect matches.

use crate::cache::PageCache;
use crate::error::CoreError;
use crate::geometry::bounding_box::Aabb;
use crate::octree::{Containment, NodeId, Octree};
use crate::page::Page;
use crate::point::{PointFile, SideStream};
use crate::query::{QueryWhere, RegionShape};
use crate::voxel::NonEmptyProbe;
use log::warn;

pub struct QueryEngine {
    octree: Octree,
    points: PointFile,
    sides: SideStream,
    cache: PageCache<NodeId, Page>,
}

impl QueryEngine {
    pub fn new(octree: Octree, points: PointFile, sides: SideStream, cache_bytes: u64) -> Self {
        QueryEngine {
            octree,
            points,
            sides,
            cache: PageCache::new(cache_bytes),
            }
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn points_mut(&mut self) -> &mut PointFile {
        &mut self.points
    }

    pub fn sides_mut(&mut self) -> &mut SideStream {
        &mut self.sides
    }

    /// Reads the raw point/attribute range for `id` from storage into a
    /// freshly allocated page at `PipelineState::Read`.
    fn load(&mut self, id: NodeId) -> Result<Page, CoreError> {
        let node = self.octree.node(id);
        let from = node.from;
        let count = node.size;

        let mut points = Vec::with_capacity(count as usize);
        let mut attrs = Vec::with_capacity(count as usize);
        for ordinal in from..from + count {
            points.push(self.points.read_point(ordinal)?);
            attrs.push(self.sides.read(ordinal)?);
        }

        let mut page = Page::new(id);
        page.read(points, attrs)?;
        Ok(page)
    }

    fn select_mask(page: &Page, containment: Containment, where_: &QueryWhere) -> Vec<bool> {
        page.points()
            .iter()
            .zip(page.attributes())
            .map(|(point, attrs)| {
                let region_ok = containment == Containment::Full || where_.region.contains_point(&point.position);
                region_ok && where_.matches(point, attrs)
            })
            .collect()
    }

    /// Loads the raw point/attribute range for `id` from storage,
    /// carries it through the page pipeline against `where_`, and
    /// returns the selected ordinals (relative to the node's `from`
    /// offset).
    fn load_and_select(&mut self, id: NodeId, containment: Containment, where_: &QueryWhere) -> Result<Page, CoreError> {
        let mut page = self.load(id)?;
        let mask = Self::select_mask(&page, containment, where_);
        page.select(mask)?;
        page.render()?;
        Ok(page)
    }

    /// Writes a page's current points and attributes back to this
    /// engine's storage at its node's `from` offset, if dirty.
    fn write_back_page(&mut self, id: NodeId, page: &mut Page) -> Result<(), CoreError> {
        let from = self.octree.node(id).from;
        page.write_back(from, &mut self.points, &mut self.sides)
    }

    /// Runs `where_` against the whole index and returns every matching
    /// point's ordinal within its page, paired with the page id, so
    /// callers can look up the rest of a point's attributes later if
    /// needed.
    ///
    /// Equivalent to `run_capped(where_, None)`.
    pub fn run(&mut self, where_: &QueryWhere) -> Result<Vec<(NodeId, u64)>, CoreError> {
        self.run_capped(where_, None)
    }

    /// As [QueryEngine::run], but stops enumerating further pages as soon
    /// as `maximum_results` matches have been accumulated. A page read
    /// failure is logged and that single page is skipped rather than
    /// aborting the whole query: a partial page loss never corrupts the
    /// cache or any other page.
    pub fn run_capped(
        &mut self,
        where_: &QueryWhere,
        maximum_results: Option<usize>,
    ) -> Result<Vec<(NodeId, u64)>, CoreError> {
        let selected_pages = self.octree.select_pages(&where_.region);
        let mut results = Vec::new();
        for (id, containment) in selected_pages {
            // A cached page may have been selected/rendered against a
            // different `where_` (or carry an edit from `run_modify`);
            // reset it to `Read` and reselect rather than trust a stale
            // selection mask.
            let page = match self.cache.remove(&id) {
                Some(mut cached) => {
                    cached.reset_to(crate::page::PipelineState::Read);
                    let mask = Self::select_mask(&cached, containment, where_);
                    cached.select(mask)?;
                    cached.render()?;
                    cached
                }
                None => match self.load_and_select(id, containment, where_) {
                    Ok(page) => page,
                    Err(err @ CoreError::Io { .. }) => {
                        warn!("skipping page {id:?} after read failure: {err}");
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };
            let base = self.octree.node(id).from;
            results.extend(page.rendered().iter().map(|&i| (id, base + i as u64)));
            self.insert_page(id, page)?;
            if Self::cap_reached(&results, maximum_results) {
                results.truncate(maximum_results.unwrap());
                break;
            }
        }
        Ok(results)
    }

    /// Inserts `page` into the cache, writing back any dirty pages that
    /// eviction pressure pushes out in the process.
    fn insert_page(&mut self, id: NodeId, page: Page) -> Result<(), CoreError> {
        let evicted = self.cache.insert(id, page);
        for (evicted_id, mut evicted_page) in evicted {
            self.write_back_page(evicted_id, &mut evicted_page)?;
        }
        Ok(())
    }

    /// Runs `where_` against the whole index as in [QueryEngine::run],
    /// but instead of just collecting matches, calls `modifier` on every
    /// matching point's side attributes - used to assign a segment id,
    /// recompute a classification, or any other in-place edit. Touched
    /// pages are marked dirty and stay cached until evicted or
    /// [QueryEngine::flush]ed; the edit is not visible on disk until
    /// then. Returns the number of points the modifier ran on.
    pub fn run_modify(
        &mut self,
        where_: &QueryWhere,
        mut modifier: impl FnMut(&crate::point::PointRecord, &mut crate::point::SideAttributes),
    ) -> Result<usize, CoreError> {
        let selected_pages = self.octree.select_pages(&where_.region);
        let mut touched = 0usize;
        for (id, containment) in selected_pages {
            let mut page = match self.cache.remove(&id) {
                Some(mut cached) => {
                    cached.reset_to(crate::page::PipelineState::Read);
                    cached
                }
                None => self.load(id)?,
            };
            let mask = Self::select_mask(&page, containment, where_);
            touched += mask.iter().filter(|m| **m).count();
            page.select(mask)?;
            page.run_modifiers(&mut modifier)?;
            page.render()?;
            self.insert_page(id, page)?;
        }
        Ok(touched)
    }

    /// Writes back every dirty cached page to storage, clearing its
    /// dirty flag, without evicting anything from the cache.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        let dirty_ids: Vec<NodeId> = self
            .cache
            .iter()
            .filter(|(_, page)| page.is_dirty())
            .map(|(id, _)| *id)
            .collect();
        for id in dirty_ids {
            let from = self.octree.node(id).from;
            if let Some(page) = self.cache.touch(&id) {
                page.write_back(from, &mut self.points, &mut self.sides)?;
            }
        }
        Ok(())
    }

    fn cap_reached(results: &[(NodeId, u64)], maximum_results: Option<usize>) -> bool {
        matches!(maximum_results, Some(max) if results.len() >= max)
    }

    /// Whether any point matching `where_` lies inside `bounds`, used by
    /// [crate::voxel::VoxelIterator] to prune whole empty sub-boxes
    /// without enumerating their points. Runs a single-result query
    /// whose region is `bounds` intersected with `where_`'s own region
    /// shape's bounding box - the caller is expected to have already
    /// restricted `bounds` to the voxelized region, so a plain box
    /// region suffices here.
    pub fn any_point_in(&mut self, bounds: &Aabb, where_: &QueryWhere) -> Result<bool, CoreError> {
        let mut probe_where = where_.clone();
        probe_where.region = RegionShape::Box(*bounds);
        Ok(!self.run_capped(&probe_where, Some(1))?.is_empty())
    }
}

/// Adapts a [QueryEngine] plus a fixed `where_` clause (minus its region,
/// which [crate::voxel::VoxelIterator] supplies per sub-box) to the
/// [NonEmptyProbe] trait.
pub struct EngineProbe<'a> {
    pub engine: &'a mut QueryEngine,
    pub where_: QueryWhere,
}

impl<'a> NonEmptyProbe for EngineProbe<'a> {
    fn any_point_in(&mut self, bounds: &Aabb) -> bool {
        self.engine.any_point_in(bounds, &self.where_).unwrap_or_else(|err| {
            warn!("voxel probe query failed, treating sub-box as empty: {err}");
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IndexBuilder;
    use crate::octree::sidecar::read_octree;
    use crate::point::file::side_stream_path;
    use crate::settings::Settings;
    use crate::voxel::VoxelIterator;
    use las::point::Format as LasFormat;
    use las::raw::point::{Flags, ScanAngle};
    use las::raw::{Header, Point as RawPoint};
    use nalgebra::Point3;
    use std::fs::File;
    use std::path::Path;

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

    fn build_sphere_dataset(dir: &Path) -> QueryEngine {
        let input = dir.join("input.las");
        // 1000 points uniform on [0,1]^3, deterministic rather than random
        // so the test has no flakiness - matches scenario (c) in shape.
        let mut points = Vec::new();
        for i in 0..10u32 {
            for j in 0..10u32 {
                for k in 0..10u32 {
                    points.push(Point3::new(
                        i as f64 / 9.0,
                        j as f64 / 9.0,
                        k as f64 / 9.0,
                    ));
                }
            }
        }
        write_test_las(&input, &points);

        let data_dir = dir.join("index");
        let settings = Settings {
            max_index_l1_size: 64,
            max_index_l1_level: 6,
            max_index_l2_size: 32,
            max_index_l2_level: 4,
            ..Settings::default()
        };
        let mut builder = IndexBuilder::new(settings.clone(), input, &data_dir).unwrap();
        builder.run_to_completion().unwrap();

        let points = PointFile::open(builder.points_path()).unwrap();
        let sides = SideStream::open(side_stream_path(builder.points_path(), "side")).unwrap();
        let sidecar_bytes = std::fs::read(builder.sidecar_path()).unwrap();
        let chunk = crate::chunk::Chunk::read_from(builder.sidecar_path(), sidecar_bytes.as_slice()).unwrap();
        let octree = read_octree(builder.sidecar_path(), &chunk).unwrap();

        QueryEngine::new(octree, points, sides, settings.cache_bytes)
    }

    #[test]
    fn sphere_query_respects_maximum_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = build_sphere_dataset(dir.path());

        let where_ = QueryWhere {
            region: RegionShape::Sphere {
                center: Point3::new(0.5, 0.5, 0.5),
                radius: 0.3,
            },
            ..QueryWhere::default()
        };

        let all = engine.run_capped(&where_, None).unwrap();
        assert!(!all.is_empty());

        let capped = engine.run_capped(&where_, Some(3)).unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[test]
    fn voxel_iterator_matches_query_selected_points() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = build_sphere_dataset(dir.path());

        let where_ = QueryWhere {
            region: RegionShape::Box(Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0))),
            ..QueryWhere::default()
        };
        let selected = engine.run_capped(&where_, None).unwrap();
        assert!(!selected.is_empty());

        let region = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let mut probe = EngineProbe {
            engine: &mut engine,
            where_: where_.clone(),
        };
        let cells: Vec<_> = VoxelIterator::new(region, 0.2, &mut probe).collect();
        assert!(!cells.is_empty());
    }

    /// A `max_index_l1_size` of 1 forces the coarse root to close to new
    /// points after its very first insert, while still keeping that one
    /// point for itself - every other point cascades into a child. A
    /// full-box query must still return every input point, proving
    /// `select_pages` (not `select_leaves`) is what `run_capped` walks.
    #[test]
    fn full_box_query_finds_points_owned_directly_by_inner_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.las");
        let mut points = Vec::new();
        for i in 0..8u32 {
            for j in 0..8u32 {
                points.push(Point3::new(i as f64 / 7.0, j as f64 / 7.0, 0.5));
            }
        }
        write_test_las(&input, &points);

        let data_dir = dir.path().join("index");
        let settings = Settings {
            max_index_l1_size: 1,
            max_index_l1_level: 6,
            ..Settings::default()
        };
        let mut builder = IndexBuilder::new(settings.clone(), input, &data_dir).unwrap();
        builder.run_to_completion().unwrap();

        let point_file = PointFile::open(builder.points_path()).unwrap();
        let sides = SideStream::open(side_stream_path(builder.points_path(), "side")).unwrap();
        let sidecar_bytes = std::fs::read(builder.sidecar_path()).unwrap();
        let chunk = crate::chunk::Chunk::read_from(builder.sidecar_path(), sidecar_bytes.as_slice()).unwrap();
        let octree = read_octree(builder.sidecar_path(), &chunk).unwrap();
        assert!(
            octree.pages().len() > octree.leaves().len(),
            "max_index_l1_size=1 must leave at least one inner node holding a point of its own"
        );

        let mut engine = QueryEngine::new(octree, point_file, sides, settings.cache_bytes);
        let where_ = QueryWhere::default();
        let found = engine.run(&where_).unwrap();
        assert_eq!(
            found.len(),
            points.len(),
            "every input point must be reachable through select_pages, including those an inner node keeps directly"
        );
    }
}
