use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

/// An axis aligned bounding box.
///
/// The bounding box is defined via a minimum and a maximum bound. However, no assertion is made if
/// `min <= max` actually holds. If the min bound is larger than the max bound, the bounding box
/// can be thought of as being empty.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptionAabb {
    min: Point3<f64>,
    max: Point3<f64>,
}

impl OptionAabb {
    /// Constructs an empty bounding box.
    pub fn empty() -> Self {
        OptionAabb {
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        OptionAabb { min, max }
    }

    /// Checks, if the bounding box is empty.
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn contains(&self, point: &Point3<f64>) -> bool {
        self.min.x <= point.x
            && self.min.y <= point.y
            && self.min.z <= point.z
            && self.max.x >= point.x
            && self.max.y >= point.y
            && self.max.z >= point.z
    }

    pub fn extend(&mut self, point: &Point3<f64>) {
        if self.min.x > point.x {
            self.min.x = point.x;
        }
        if self.min.y > point.y {
            self.min.y = point.y;
        }
        if self.min.z > point.z {
            self.min.z = point.z;
        }
        if self.max.x < point.x {
            self.max.x = point.x;
        }
        if self.max.y < point.y {
            self.max.y = point.y;
        }
        if self.max.z < point.z {
            self.max.z = point.z;
        }
    }

    pub fn extend_box(&mut self, other: &OptionAabb) {
        if other.min.x < self.min.x {
            self.min.x = other.min.x;
        }
        if other.min.y < self.min.y {
            self.min.y = other.min.y;
        }
        if other.min.z < self.min.z {
            self.min.z = other.min.z;
        }
        if other.max.x > self.max.x {
            self.max.x = other.max.x;
        }
        if other.max.y > self.max.y {
            self.max.y = other.max.y;
        }
        if other.max.z > self.max.z {
            self.max.z = other.max.z;
        }
    }

    /// Tries to convert this [OptionAabb] into an [Aabb].
    /// Returns None, if the bounding box is empty, otherwise the
    /// corresponding [Aabb] with the same bounds is returned.
    pub fn into_aabb(self) -> Option<Aabb> {
        if self.is_empty() {
            None
        } else {
            Some(Aabb { inner: self })
        }
    }
}

impl Default for OptionAabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for OptionAabb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "OptionAabb (empty)")
        } else {
            write!(
                f,
                "OptionAabb ({:?},{:?},{:?} - {:?},{:?},{:?})",
                self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
            )
        }
    }
}

/// An axis aligned bounding box, that is guaranteed to be non-empty.
///
/// An [Aabb] can be obtained from an [OptionAabb], by checking for its emptiness:
/// ```rust
/// use nalgebra::Point3;
/// use forest_index_common::geometry::bounding_box::OptionAabb;
///
/// let option_aabb = OptionAabb::new(
///     Point3::new(0.0, 0.0, 0.0),
///     Point3::new(2.3, 2.3, 2.3),
/// );
/// let aabb = match option_aabb.into_aabb() {
///     Some(a) => a,
///     None => panic!("Aabb is empty"),
/// };
/// ```
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    inner: OptionAabb,
}

impl Aabb {
    /// Create a new Aabb from the specified bounds.
    /// Panics, if for any component the min bound is larger than the max bound.
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        assert!(min.x <= max.x);
        assert!(min.y <= max.y);
        assert!(min.z <= max.z);
        Aabb {
            inner: OptionAabb::new(min, max),
        }
    }

    pub fn min(&self) -> Point3<f64> {
        self.inner.min
    }

    pub fn max(&self) -> Point3<f64> {
        self.inner.max
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::new(
            (self.inner.min.x + self.inner.max.x) * 0.5,
            (self.inner.min.y + self.inner.max.y) * 0.5,
            (self.inner.min.z + self.inner.max.z) * 0.5,
        )
    }

    /// The side length of this box along the given axis (0=x, 1=y, 2=z).
    pub fn length(&self, axis: usize) -> f64 {
        self.inner.max[axis] - self.inner.min[axis]
    }

    /// The distance of the center of this box to its corner, i.e. the
    /// radius of the smallest enclosing sphere centered on [Self::center].
    pub fn radius(&self) -> f64 {
        let c = self.center();
        (c - self.inner.min).norm()
    }

    /// Euclidean distance from `point` to the closest point contained in this box
    /// (zero, if `point` lies inside the box).
    pub fn distance(&self, point: &Point3<f64>) -> f64 {
        let dx = (self.inner.min.x - point.x).max(0.0).max(point.x - self.inner.max.x);
        let dy = (self.inner.min.y - point.y).max(0.0).max(point.y - self.inner.max.y);
        let dz = (self.inner.min.z - point.z).max(0.0).max(point.z - self.inner.max.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn contains(&self, point: &Point3<f64>) -> bool {
        self.inner.contains(point)
    }

    /// Whether `self` lies entirely within `other`.
    pub fn inside(&self, other: &Aabb) -> bool {
        self.inner.min.x >= other.inner.min.x
            && self.inner.min.y >= other.inner.min.y
            && self.inner.min.z >= other.inner.min.z
            && self.inner.max.x <= other.inner.max.x
            && self.inner.max.y <= other.inner.max.y
            && self.inner.max.z <= other.inner.max.z
    }

    pub fn intersects(&self, other: &Self) -> bool {
        if self.inner.max.x < other.inner.min.x {
            return false;
        }
        if self.inner.max.y < other.inner.min.y {
            return false;
        }
        if self.inner.max.z < other.inner.min.z {
            return false;
        }
        if self.inner.min.x > other.inner.max.x {
            return false;
        }
        if self.inner.min.y > other.inner.max.y {
            return false;
        }
        if self.inner.min.z > other.inner.max.z {
            return false;
        }
        true
    }

    pub fn extend_union(&mut self, other: &Self) {
        self.inner.extend_box(&other.inner);
    }

    pub fn as_option(&self) -> OptionAabb {
        self.inner
    }
}

impl Debug for Aabb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Aabb ({:?},{:?},{:?} - {:?},{:?},{:?})",
            self.inner.min.x,
            self.inner.min.y,
            self.inner.min.z,
            self.inner.max.x,
            self.inner.max.y,
            self.inner.max.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Aabb, OptionAabb};
    use nalgebra::Point3;

    #[test]
    fn is_empty() {
        let aabb = OptionAabb::empty();
        assert!(aabb.is_empty());
        assert!(aabb.into_aabb().is_none());
    }

    #[test]
    fn contains() {
        let aabb = OptionAabb::new(Point3::new(2.0, 4.0, 1.0), Point3::new(4.0, 5.0, 2.0));
        assert!(aabb.contains(&Point3::new(2.0, 4.0, 1.0)));
        assert!(aabb.contains(&Point3::new(3.0, 4.5, 1.5)));
        assert!(aabb.contains(&Point3::new(4.0, 5.0, 2.0)));
        assert!(!aabb.contains(&Point3::new(1.5, 4.5, 1.5)));
        assert!(!aabb.contains(&Point3::new(4.5, 4.5, 1.5)));
    }

    #[test]
    fn extend() {
        let mut aabb = OptionAabb::empty();
        aabb.extend(&Point3::new(1.0, 2.0, 3.0));
        aabb.extend(&Point3::new(3.0, 2.0, 1.0));
        let aabb = aabb.into_aabb().unwrap();
        assert_eq!(aabb.min(), Point3::new(1.0, 2.0, 1.0));
        assert_eq!(aabb.max(), Point3::new(3.0, 2.0, 3.0));
    }

    #[test]
    fn inside_and_intersects() {
        let outer = OptionAabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0))
            .into_aabb()
            .unwrap();
        let inner = OptionAabb::new(Point3::new(2.0, 2.0, 2.0), Point3::new(4.0, 4.0, 4.0))
            .into_aabb()
            .unwrap();
        let overlapping = OptionAabb::new(Point3::new(9.0, 9.0, 9.0), Point3::new(20.0, 20.0, 20.0))
            .into_aabb()
            .unwrap();
        assert!(inner.inside(&outer));
        assert!(!outer.inside(&inner));
        assert!(outer.intersects(&overlapping));
        assert!(!inner.intersects(&overlapping));
    }

    #[test]
    fn length_and_distance() {
        let aabb = OptionAabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 4.0, 8.0))
            .into_aabb()
            .unwrap();
        assert_eq!(aabb.length(0), 2.0);
        assert_eq!(aabb.length(1), 4.0);
        assert_eq!(aabb.length(2), 8.0);
        assert_eq!(aabb.distance(&Point3::new(1.0, 1.0, 1.0)), 0.0);
        assert_eq!(aabb.distance(&Point3::new(-3.0, 0.0, 0.0)), 3.0);
    }
}
