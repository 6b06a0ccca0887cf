//! On-disk persistence for an [Octree], stored as a single chunk inside
//! this crate's chunk container (see [crate::chunk]).
//!
//! The payload is a fixed 104-byte header - node count, root box, points
//! box - followed by one fixed-size record per node in array order. Node
//! records store parent/child links as plain `u32`s with `0` standing in
//! for "none", since node IDs are already 1-based for exactly this reason.

use crate::chunk::{Chunk, ChunkVersion, CHUNK_TYPE_OCTREE_INDEX, OCTREE_INDEX_VERSION_1_0};
use crate::error::CoreError;
use crate::geometry::bounding_box::{Aabb, OptionAabb};
use crate::octree::{NodeId, Octree, OctreeNode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::Point3;
use std::io::Cursor;
use std::num::NonZeroU32;
use std::path::Path;

/// Size in bytes of the fixed header preceding the node records: an
/// 8-byte node count, a 48-byte root box (6 f64s), and a 48-byte points
/// box (6 f64s, or `+inf`/`-inf` sentinels if the tree has no points).
pub const SIDECAR_HEADER_LEN: usize = 8 + 6 * 8 + 6 * 8;

/// Size in bytes of one packed node record: parent + 8 children (all
/// `u32`), then `size`/`from`/`offset` (all `u64`).
pub const SIDECAR_NODE_LEN: usize = 4 * 9 + 8 * 3;

fn encode_node_id(id: Option<NodeId>) -> u32 {
    id.map(|i| i.get()).unwrap_or(0)
}

fn decode_node_id(raw: u32) -> Option<NodeId> {
    NonZeroU32::new(raw)
}

/// Serializes `tree` into a [Chunk] payload matching [SIDECAR_HEADER_LEN]
/// and [SIDECAR_NODE_LEN].
pub fn write_octree(path: &Path, tree: &Octree) -> Result<Chunk, CoreError> {
    let mut data = Vec::with_capacity(SIDECAR_HEADER_LEN + tree.len() * SIDECAR_NODE_LEN);

    data.write_u64::<LittleEndian>(tree.len() as u64)
        .map_err(|e| CoreError::io(path, e))?;

    let root_box = tree.root_box();
    for value in [
        root_box.min().x,
        root_box.min().y,
        root_box.min().z,
        root_box.max().x,
        root_box.max().y,
        root_box.max().z,
    ] {
        data.write_f64::<LittleEndian>(value)
            .map_err(|e| CoreError::io(path, e))?;
    }

    let points_box = tree.points_box();
    for value in [
        points_box.into_aabb().map(|b| b.min().x).unwrap_or(f64::INFINITY),
        points_box.into_aabb().map(|b| b.min().y).unwrap_or(f64::INFINITY),
        points_box.into_aabb().map(|b| b.min().z).unwrap_or(f64::INFINITY),
        points_box.into_aabb().map(|b| b.max().x).unwrap_or(f64::NEG_INFINITY),
        points_box.into_aabb().map(|b| b.max().y).unwrap_or(f64::NEG_INFINITY),
        points_box.into_aabb().map(|b| b.max().z).unwrap_or(f64::NEG_INFINITY),
    ] {
        data.write_f64::<LittleEndian>(value)
            .map_err(|e| CoreError::io(path, e))?;
    }

    for i in 0..tree.len() {
        let id = NonZeroU32::new((i + 1) as u32).unwrap();
        let node = tree.node(id);
        data.write_u32::<LittleEndian>(encode_node_id(node.parent))
            .map_err(|e| CoreError::io(path, e))?;
        for child in node.children {
            data.write_u32::<LittleEndian>(encode_node_id(child))
                .map_err(|e| CoreError::io(path, e))?;
        }
        data.write_u64::<LittleEndian>(node.size)
            .map_err(|e| CoreError::io(path, e))?;
        data.write_u64::<LittleEndian>(node.from)
            .map_err(|e| CoreError::io(path, e))?;
        data.write_u64::<LittleEndian>(node.offset)
            .map_err(|e| CoreError::io(path, e))?;
    }

    Ok(Chunk {
        chunk_type: CHUNK_TYPE_OCTREE_INDEX,
        version: OCTREE_INDEX_VERSION_1_0,
        data,
    })
}

/// Reconstructs an [Octree] from a chunk previously produced by
/// [write_octree]. The returned tree is read-only with respect to
/// `max_size`/`max_level`/`only_to_leaves`: those fields are reset to
/// values that make [Octree::insert] a no-op path, since a loaded index
/// is queried, never grown in place.
pub fn read_octree(path: &Path, chunk: &Chunk) -> Result<Octree, CoreError> {
    chunk.expect(path, CHUNK_TYPE_OCTREE_INDEX, OCTREE_INDEX_VERSION_1_0)?;
    if chunk.data.len() < SIDECAR_HEADER_LEN {
        return Err(crate::error::FormatError {
            path: path.to_owned(),
            message: format!(
                "sidecar payload too short: {} bytes, need at least {SIDECAR_HEADER_LEN}",
                chunk.data.len()
            ),
        }
        .into());
    }

    let mut cursor = Cursor::new(&chunk.data);
    let node_count = cursor.read_u64::<LittleEndian>().map_err(|e| CoreError::io(path, e))? as usize;

    let mut root = [0f64; 6];
    for slot in root.iter_mut() {
        *slot = cursor.read_f64::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
    }
    let root_box = Aabb::new(
        Point3::new(root[0], root[1], root[2]),
        Point3::new(root[3], root[4], root[5]),
    );

    let mut points = [0f64; 6];
    for slot in points.iter_mut() {
        *slot = cursor.read_f64::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
    }
    let points_box = OptionAabb::new(
        Point3::new(points[0], points[1], points[2]),
        Point3::new(points[3], points[4], points[5]),
    );

    let expected_len = SIDECAR_HEADER_LEN + node_count * SIDECAR_NODE_LEN;
    if chunk.data.len() != expected_len {
        return Err(crate::error::FormatError {
            path: path.to_owned(),
            message: format!(
                "sidecar payload length {} does not match node count {node_count} (expected {expected_len})",
                chunk.data.len()
            ),
        }
        .into());
    }

    let mut nodes = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        let parent = decode_node_id(cursor.read_u32::<LittleEndian>().map_err(|e| CoreError::io(path, e))?);
        let mut children = [None; 8];
        for child in children.iter_mut() {
            *child = decode_node_id(cursor.read_u32::<LittleEndian>().map_err(|e| CoreError::io(path, e))?);
        }
        let size = cursor.read_u64::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        let from = cursor.read_u64::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        let offset = cursor.read_u64::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        nodes.push(OctreeNode {
            parent,
            children,
            size,
            from,
            offset,
        });
    }

    Ok(Octree::from_parts(nodes, root_box, points_box))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn round_trips_an_octree() {
        let root_box = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(8.0, 8.0, 8.0));
        let mut tree = Octree::build_begin(root_box, 2, 6, false);
        for p in [
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(7.0, 7.0, 7.0),
        ] {
            tree.insert(p);
        }
        tree.build_end();

        let path = PathBuf::from("index.sidecar");
        let chunk = write_octree(&path, &tree).unwrap();
        let restored = read_octree(&path, &chunk).unwrap();

        assert_eq!(restored.len(), tree.len());
        assert_eq!(restored.root_box(), tree.root_box());
        for i in 1..=tree.len() {
            let id = NonZeroU32::new(i as u32).unwrap();
            assert_eq!(restored.node(id).size, tree.node(id).size);
            assert_eq!(restored.node(id).from, tree.node(id).from);
            assert_eq!(restored.node(id).parent, tree.node(id).parent);
            assert_eq!(restored.node(id).children, tree.node(id).children);
        }
    }
}
