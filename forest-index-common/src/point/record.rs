//! Typed point record, as read out of (or written into) the external
//! point-record file and its attribute side-streams.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// The subset of a LAS point's fields this crate's index cares about.
/// Coordinates have already been scaled and offset to doubles by the
/// `las` crate; `classification`, `return_number` and `number_of_returns`
/// are kept in their widest (extended-format) representation regardless
/// of which format the point was read from, since the builder upgrades
/// every point to a common format before it is ever stored in a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub position: Point3<f64>,
    pub intensity: u16,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub classification: u8,
    pub user_data: u8,
    pub point_source_id: u16,
    pub gps_time: Option<f64>,
    pub color: Option<(u16, u16, u16)>,
}

/// Sentinel for "this point has no voxel back-reference yet". Index 0 is
/// reserved, since node/voxel indices elsewhere in this crate are 1-based
/// for the same reason (so that a plain `u32` field can double as an
/// `Option` without extra storage).
pub const NO_VOXEL: u32 = 0;

/// The four per-point attribute side-streams, read/written in lock-step
/// with the position/LAS fields above, indexed by point ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SideAttributes {
    pub segment_id: i32,
    pub elevation: f32,
    pub descriptor: f32,
    pub voxel: u32,
}

impl Default for SideAttributes {
    fn default() -> Self {
        SideAttributes {
            segment_id: -1,
            elevation: f32::NAN,
            descriptor: f32::NAN,
            voxel: NO_VOXEL,
        }
    }
}
