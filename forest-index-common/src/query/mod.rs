//! The query predicate: a fixed, conjunctive `WHERE` clause evaluated
//! against every point in a selected page, plus the region shapes used
//! to prune which pages are visited at all.
//!
//! There is deliberately no general expression tree here - the
//! predicate set is closed, matching a point cloud that always carries
//! the same fixed attributes. Evaluation order is fixed too, cheapest
//! and most selective checks first, so that a point failing an early
//! check never pays for the later ones.

pub mod engine;

use crate::geometry::bounding_box::Aabb;
use crate::octree::{Containment, Region};
use crate::point::{PointRecord, SideAttributes};
use nalgebra::{Point3, Vector3};
use std::ops::RangeInclusive;

/// A 256-bit set of accepted classification codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationMask([u64; 4]);

impl ClassificationMask {
    pub fn all() -> Self {
        ClassificationMask([u64::MAX; 4])
    }

    pub fn none() -> Self {
        ClassificationMask([0; 4])
    }

    pub fn set(&mut self, classification: u8, accept: bool) {
        let word = (classification / 64) as usize;
        let bit = classification % 64;
        if accept {
            self.0[word] |= 1 << bit;
        } else {
            self.0[word] &= !(1 << bit);
        }
    }

    pub fn contains(&self, classification: u8) -> bool {
        let word = (classification / 64) as usize;
        let bit = classification % 64;
        self.0[word] & (1 << bit) != 0
    }
}

impl Default for ClassificationMask {
    fn default() -> Self {
        Self::all()
    }
}

/// The shape a region-of-interest query is expressed in. Each variant
/// implements [Region] so the octree can prune whole subtrees without
/// any shape-specific knowledge in [crate::octree].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionShape {
    Box(Aabb),
    Sphere { center: Point3<f64>, radius: f64 },
    /// An axis-aligned (along `axis`) cylinder of infinite cross-section
    /// radius `radius`, spanning `[center - axis * half_height, center +
    /// axis * half_height]`.
    Cylinder {
        center: Point3<f64>,
        axis: Vector3<f64>,
        radius: f64,
        half_height: f64,
    },
    /// A cone with its apex at `apex`, opening along `axis` for `height`
    /// units, with half-angle `half_angle_radians`.
    Cone {
        apex: Point3<f64>,
        axis: Vector3<f64>,
        half_angle_radians: f64,
        height: f64,
    },
}

/// The half-extent, along each world axis, of a flat disk of radius `r`
/// whose normal is `axis` (need not be normalized): `r * sqrt(1 -
/// (axis_k / |axis|)^2)` per component, the projection of the disk's rim
/// onto that axis.
fn disk_extent(axis: &Vector3<f64>, r: f64) -> Vector3<f64> {
    let n = axis.normalize();
    Vector3::new(
        r * (1.0 - n.x * n.x).max(0.0).sqrt(),
        r * (1.0 - n.y * n.y).max(0.0).sqrt(),
        r * (1.0 - n.z * n.z).max(0.0).sqrt(),
    )
}

/// The half-extent, along each world axis, of a cylinder of radius `r`
/// and half-length `half_height` whose axis is `axis`: the two end-cap
/// disks' own extents, plus how far each cap's center sits from the
/// cylinder's center along that world axis.
fn disk_pair_extent(axis: &Vector3<f64>, r: f64, half_height: f64) -> Vector3<f64> {
    let n = axis.normalize();
    let caps = disk_extent(axis, r);
    Vector3::new(
        caps.x + half_height * n.x.abs(),
        caps.y + half_height * n.y.abs(),
        caps.z + half_height * n.z.abs(),
    )
}

impl RegionShape {
    fn contains_point(&self, p: &Point3<f64>) -> bool {
        match self {
            RegionShape::Box(b) => b.contains(p),
            RegionShape::Sphere { center, radius } => (p - center).norm() <= *radius,
            RegionShape::Cylinder {
                center,
                axis,
                radius,
                half_height,
            } => {
                let axis = axis.normalize();
                let d = p - center;
                let along = d.dot(&axis);
                if along.abs() > *half_height {
                    return false;
                }
                let radial = d - axis * along;
                radial.norm() <= *radius
            }
            RegionShape::Cone {
                apex,
                axis,
                half_angle_radians,
                height,
            } => {
                let axis = axis.normalize();
                let d = p - apex;
                let along = d.dot(&axis);
                if along < 0.0 || along > *height {
                    return false;
                }
                let radial = (d - axis * along).norm();
                radial <= along * half_angle_radians.tan()
            }
        }
    }

    /// A conservative bounding box enclosing the whole shape, used to
    /// quickly reject boxes that cannot possibly intersect it.
    fn bounds(&self) -> Aabb {
        match self {
            RegionShape::Box(b) => *b,
            RegionShape::Sphere { center, radius } => Aabb::new(
                center - Vector3::new(*radius, *radius, *radius),
                center + Vector3::new(*radius, *radius, *radius),
            ),
            RegionShape::Cylinder {
                center,
                axis,
                radius,
                half_height,
            } => {
                let extent = disk_pair_extent(axis, *radius, *half_height);
                Aabb::new(center - extent, center + extent)
            }
            RegionShape::Cone {
                apex,
                axis,
                half_angle_radians,
                height,
            } => {
                let axis = axis.normalize();
                let base_center = apex + axis * *height;
                let base_radius = *height * half_angle_radians.tan();
                let base_extent = disk_extent(&axis, base_radius);
                let base_min = base_center - base_extent;
                let base_max = base_center + base_extent;
                Aabb::new(
                    Point3::new(apex.x.min(base_min.x), apex.y.min(base_min.y), apex.z.min(base_min.z)),
                    Point3::new(apex.x.max(base_max.x), apex.y.max(base_max.y), apex.z.max(base_max.z)),
                )
            }
        }
    }
}

impl Region for RegionShape {
    fn test(&self, b: &Aabb) -> Containment {
        if !self.bounds().intersects(b) {
            return Containment::Outside;
        }
        // Exact full-containment is only cheap for boxes; for curved
        // shapes we conservatively test all eight corners and fall back
        // to Partial whenever that isn't conclusive, trading a few
        // unnecessary point-level checks for avoiding a false Full.
        match self {
            RegionShape::Box(region) => {
                if b.inside(region) {
                    Containment::Full
                } else if region.intersects(b) {
                    Containment::Partial
                } else {
                    Containment::Outside
                }
            }
            _ => {
                let corners = [
                    Point3::new(b.min().x, b.min().y, b.min().z),
                    Point3::new(b.max().x, b.min().y, b.min().z),
                    Point3::new(b.min().x, b.max().y, b.min().z),
                    Point3::new(b.max().x, b.max().y, b.min().z),
                    Point3::new(b.min().x, b.min().y, b.max().z),
                    Point3::new(b.max().x, b.min().y, b.max().z),
                    Point3::new(b.min().x, b.max().y, b.max().z),
                    Point3::new(b.max().x, b.max().y, b.max().z),
                ];
                if corners.iter().all(|c| self.contains_point(c)) {
                    Containment::Full
                } else if corners.iter().any(|c| self.contains_point(c)) {
                    Containment::Partial
                } else if self.contains_point(&b.center()) {
                    Containment::Partial
                } else {
                    Containment::Partial
                }
            }
        }
    }
}

/// An inclusive numeric range predicate; `None` accepts everything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeFilter<T> {
    pub range: Option<RangeInclusive<T>>,
}

impl<T: PartialOrd + Copy> RangeFilter<T> {
    pub fn any() -> Self {
        RangeFilter { range: None }
    }

    pub fn new(range: RangeInclusive<T>) -> Self {
        RangeFilter { range: Some(range) }
    }

    pub fn matches(&self, value: T) -> bool {
        match &self.range {
            None => true,
            Some(r) => r.contains(&value),
        }
    }
}

/// The fixed conjunctive predicate set evaluated per-point. Region
/// selection happens separately, at the page level, via [RegionShape]
/// and [crate::octree::Octree::select_pages].
#[derive(Debug, Clone)]
pub struct QueryWhere {
    pub region: RegionShape,
    pub classification: ClassificationMask,
    pub segment: RangeFilter<i32>,
    /// Species code, modeled on the point's `user_data` byte per this
    /// crate's fixed point layout.
    pub species: RangeFilter<u8>,
    /// Management status code, modeled on the low byte of the point's
    /// `point_source_id` field per this crate's fixed point layout.
    pub management_status: RangeFilter<u8>,
    pub elevation: RangeFilter<f32>,
    pub descriptor: RangeFilter<f32>,
    pub intensity: RangeFilter<u16>,
}

impl Default for QueryWhere {
    fn default() -> Self {
        QueryWhere {
            region: RegionShape::Box(Aabb::new(
                Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
                Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            )),
            classification: ClassificationMask::all(),
            segment: RangeFilter::any(),
            species: RangeFilter::any(),
            management_status: RangeFilter::any(),
            elevation: RangeFilter::any(),
            descriptor: RangeFilter::any(),
            intensity: RangeFilter::any(),
        }
    }
}

impl QueryWhere {
    /// Evaluates every predicate against one point/attribute pair, in
    /// the fixed, cheapest-first order: classification, then segment,
    /// species, management status (all cheap integer comparisons),
    /// before the floating point range checks, then finally intensity.
    /// Region containment is not re-checked here - the caller is
    /// expected to have already pruned by page via [RegionShape].
    pub fn matches(&self, point: &PointRecord, attrs: &SideAttributes) -> bool {
        self.classification.contains(point.classification)
            && self.segment.matches(attrs.segment_id)
            && self.species.matches(point.user_data)
            && self.management_status.matches((point.point_source_id & 0xFF) as u8)
            && self.elevation.matches(attrs.elevation)
            && self.descriptor.matches(attrs.descriptor)
            && self.intensity.matches(point.intensity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (PointRecord, SideAttributes) {
        (
            PointRecord {
                position: Point3::new(0.0, 0.0, 0.0),
                intensity: 100,
                return_number: 1,
                number_of_returns: 1,
                classification: 5,
                user_data: 2,
                point_source_id: 7,
                gps_time: None,
                color: None,
            },
            SideAttributes {
                segment_id: 42,
                elevation: 1.5,
                descriptor: 0.2,
                voxel: 0,
            },
        )
    }

    #[test]
    fn default_where_matches_everything() {
        let (p, a) = sample();
        assert!(QueryWhere::default().matches(&p, &a));
    }

    #[test]
    fn classification_mask_excludes() {
        let (p, a) = sample();
        let mut q = QueryWhere::default();
        q.classification.set(5, false);
        assert!(!q.matches(&p, &a));
    }

    #[test]
    fn elevation_range_excludes() {
        let (p, a) = sample();
        let mut q = QueryWhere::default();
        q.elevation = RangeFilter::new(10.0..=20.0);
        assert!(!q.matches(&p, &a));
    }

    #[test]
    fn box_region_reports_full_and_outside() {
        let region = RegionShape::Box(Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0)));
        let inside = Aabb::new(Point3::new(1.0, 1.0, 1.0), Point3::new(2.0, 2.0, 2.0));
        let outside = Aabb::new(Point3::new(20.0, 20.0, 20.0), Point3::new(21.0, 21.0, 21.0));
        assert_eq!(region.test(&inside), Containment::Full);
        assert_eq!(region.test(&outside), Containment::Outside);
    }

    #[test]
    fn sphere_region_rejects_far_box() {
        let region = RegionShape::Sphere {
            center: Point3::new(0.0, 0.0, 0.0),
            radius: 1.0,
        };
        let far = Aabb::new(Point3::new(100.0, 100.0, 100.0), Point3::new(101.0, 101.0, 101.0));
        assert_eq!(region.test(&far), Containment::Outside);
    }

    /// radius = half_height = 1 on a diagonal axis: the true world-axis
    /// extent is half_height*|n_k| + radius*sqrt(1-n_k^2), which for an
    /// axis evenly split across all three world axes exceeds
    /// max(radius, half_height) - the old bound undercounted this box.
    #[test]
    fn cylinder_bounds_cover_diagonal_axis_extent() {
        let region = RegionShape::Cylinder {
            center: Point3::new(0.0, 0.0, 0.0),
            axis: Vector3::new(1.0, 1.0, 1.0),
            radius: 1.0,
            half_height: 1.0,
        };
        let bounds = region.bounds();
        let n = Vector3::new(1.0, 1.0, 1.0).normalize();
        let expected = 1.0 * n.x.abs() + (1.0 - n.x * n.x).sqrt();
        assert!(bounds.max().x >= expected - 1e-9, "bound {} must cover {}", bounds.max().x, expected);

        // A box that clips the cylinder's side only along the diagonal
        // corner (outside the old max(radius, half_height) cube) must not
        // be reported Outside.
        let far_corner = Aabb::new(Point3::new(1.0, 1.0, 1.0), Point3::new(1.3, 1.3, 1.3));
        assert_ne!(region.test(&far_corner), Containment::Outside);
    }

    /// height=1, half_angle=60deg (base radius = tan(60deg) ~= 1.73, wider
    /// than height): the old `r = height` bound excluded the base disk's
    /// true radial extent.
    #[test]
    fn cone_bounds_cover_wide_half_angle() {
        let region = RegionShape::Cone {
            apex: Point3::new(0.0, 0.0, 0.0),
            axis: Vector3::new(0.0, 0.0, 1.0),
            half_angle_radians: std::f64::consts::FRAC_PI_3,
            height: 1.0,
        };
        let bounds = region.bounds();
        let base_radius = 1.0 * std::f64::consts::FRAC_PI_3.tan();
        assert!(bounds.max().x >= base_radius - 1e-9);
        assert!(bounds.max().y >= base_radius - 1e-9);

        let wide_corner = Aabb::new(Point3::new(1.5, 0.0, 0.9), Point3::new(1.6, 0.1, 1.0));
        assert_ne!(region.test(&wide_corner), Containment::Outside);
    }
}
