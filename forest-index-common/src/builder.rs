//! The resumable index builder (component C4): ingests a source LAS/LAZ
//! file and produces this crate's on-disk layout - an upgraded point
//! file, its attribute side-stream, and the coarse octree sidecar - by
//! stepping through a fixed sequence of named states, each bounded by a
//! caller-supplied deadline so a single [IndexBuilder::next] call never
//! blocks for longer than the caller is willing to wait.
//!
//! The state machine runs two passes over the point data. The first
//! (`CREATE_ATTRIBUTES` through `COPY_EVLR`) rewrites every record into
//! the destination point format while tallying the overall bounding box
//! and the intensity/color ranges needed for the renormalization
//! described below. The second (`MOVE` through `NODE_END`) reorders that
//! data into page order, and within each page into Morton/Z-order using a
//! fine, in-page octree built and discarded one page at a time. Only the
//! final `END` state touches the caller's destination files; every
//! earlier state writes only to its own temporary copy, so a builder
//! that fails or is dropped mid-run never mutates the input.
//!
//! Intensity and color are renormalized from an apparent 8-bit source to
//! the LAS wire format's full 16-bit range, but only when the whole
//! dataset's observed maximum makes that source plausible: an intensity
//! maximum strictly between 0 and 256, or a summed-RGB maximum strictly
//! between 0 and 766. A dataset that already uses the full 16-bit range
//! is left alone.

use crate::error::CoreError;
use crate::geometry::bounding_box::{Aabb, OptionAabb};
use crate::octree::sidecar::write_octree;
use crate::octree::{NodeId, Octree};
use crate::point::file::side_stream_path;
use crate::point::format::PointFormat;
use crate::point::upgrade::{extended_rgb_offset, format_point, legacy_rgb_offset};
use crate::point::{PointFile, SideStream};
use crate::settings::Settings;
use las::raw::Header;
use log::{debug, info};
use nalgebra::Point3;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Extension of the single side-stream file carrying every point's
/// [crate::point::SideAttributes] record.
const SIDE_EXT: &str = "side";

/// The builder's named states, in the fixed order they run. Declaration
/// order matches [BuilderState::index] and [BuilderState::next] - there
/// is no skipping or revisiting a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    CreateAttributes,
    CopyVlr,
    CopyPoints,
    CopyEvlr,
    Move,
    Copy,
    CopyAttributes,
    MainBegin,
    MainInsert,
    MainEnd,
    MainSort,
    NodeInsert,
    NodeEnd,
    End,
    Done,
}

/// Number of states a build progresses through before `Done`, used to
/// scale [IndexBuilder::percent].
pub const BUILDER_STATE_COUNT: u32 = 14;

impl BuilderState {
    fn index(self) -> u32 {
        use BuilderState::*;
        match self {
            CreateAttributes => 0,
            CopyVlr => 1,
            CopyPoints => 2,
            CopyEvlr => 3,
            Move => 4,
            Copy => 5,
            CopyAttributes => 6,
            MainBegin => 7,
            MainInsert => 8,
            MainEnd => 9,
            MainSort => 10,
            NodeInsert => 11,
            NodeEnd => 12,
            End => 13,
            Done => 14,
        }
    }

    fn next(self) -> BuilderState {
        use BuilderState::*;
        match self {
            CreateAttributes => CopyVlr,
            CopyVlr => CopyPoints,
            CopyPoints => CopyEvlr,
            CopyEvlr => Move,
            Move => Copy,
            Copy => CopyAttributes,
            CopyAttributes => MainBegin,
            MainBegin => MainInsert,
            MainInsert => MainEnd,
            MainEnd => MainSort,
            MainSort => NodeInsert,
            NodeInsert => NodeEnd,
            NodeEnd => End,
            End => Done,
            Done => Done,
        }
    }
}

/// A snapshot of the builder's progress, returned by every [IndexBuilder::next] call.
#[derive(Debug, Clone, Copy)]
pub struct BuilderStatus {
    pub state: BuilderState,
    /// Monotonically increasing overall progress in `[0, 1]`.
    pub percent: f32,
}

/// Drives one index build from a source point file to this crate's page
/// store and octree sidecar. See the module docs for the overall shape
/// of the two-pass pipeline.
pub struct IndexBuilder {
    settings: Settings,

    input_path: PathBuf,
    points_path: PathBuf,
    sidecar_path: PathBuf,
    tmp1_path: PathBuf,
    tmp2_path: PathBuf,

    state: BuilderState,
    /// Resume cursor for the current state: a point ordinal for the
    /// per-point states, a leaf index for `NodeInsert`, unused otherwise.
    cursor: u64,

    point_count: u64,
    src_format: PointFormat,
    dst_format: PointFormat,
    src_header: Header,
    dst_header: Header,
    extra_bytes: u16,

    points_box: OptionAabb,
    intensity_max: u16,
    rgb_sum_max: u32,

    coarse: Option<Octree>,
    used_coarse: HashMap<NodeId, u64>,

    sidecar_first_chunk_len: u64,
    /// Every coarse node that owns at least one point directly (see
    /// `Octree::pages`) - not only the tree's true leaves, since a node
    /// that filled to `max_index_l1_size` before reaching `max_index_l1_level`
    /// keeps its own points even after gaining children.
    leaves: Vec<NodeId>,
}

impl IndexBuilder {
    /// Begins a build of `input_path` into `data_dir`, which is created if
    /// it does not already exist. Reads just the source header; no point
    /// data is touched until [IndexBuilder::next] is called.
    pub fn new(settings: Settings, input_path: impl Into<PathBuf>, data_dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let input_path = input_path.into();
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(|e| CoreError::io(data_dir, e))?;

        let mut f = File::open(&input_path).map_err(|e| CoreError::io(&input_path, e))?;
        let src_header = Header::read_from(&mut f).map_err(CoreError::from)?;
        drop(f);

        let point_count = src_header.number_of_point_records as u64;
        let src_format = PointFormat(src_header.point_data_record_format & 0x7F);
        let dst_format = if settings.convert_to_version_1_4 {
            src_format.upgraded().unwrap_or(src_format)
        } else {
            src_format
        };

        let src_record_len = src_format.record_length()?;
        let extra_bytes = if settings.copy_extra_bytes {
            src_header.point_data_record_length.saturating_sub(src_record_len)
        } else {
            0
        };

        let mut dst_header = src_header.clone();
        dst_header.point_data_record_format = dst_format.0;
        dst_header.point_data_record_length = dst_format.record_length()? + extra_bytes;

        Ok(IndexBuilder {
            settings,
            input_path,
            points_path: data_dir.join("points.las"),
            sidecar_path: data_dir.join("index.sidecar"),
            tmp1_path: data_dir.join("points.tmp1.las"),
            tmp2_path: data_dir.join("points.tmp2.las"),
            state: BuilderState::CreateAttributes,
            cursor: 0,
            point_count,
            src_format,
            dst_format,
            src_header,
            dst_header,
            extra_bytes,
            points_box: OptionAabb::empty(),
            intensity_max: 0,
            rgb_sum_max: 0,
            coarse: None,
            used_coarse: HashMap::new(),
            sidecar_first_chunk_len: 0,
            leaves: Vec::new(),
        })
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn points_path(&self) -> &Path {
        &self.points_path
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    /// Overall progress, monotonically increasing from `0.0` to `1.0`.
    pub fn percent(&self) -> f32 {
        if self.state == BuilderState::Done {
            return 1.0;
        }
        let total = match self.state {
            BuilderState::CreateAttributes
            | BuilderState::CopyPoints
            | BuilderState::MainInsert
            | BuilderState::MainSort => self.point_count.max(1),
            BuilderState::NodeInsert => self.leaves.len().max(1) as u64,
            _ => 1,
        };
        let frac = (self.cursor as f64 / total as f64).min(1.0) as f32;
        (self.state.index() as f32 + frac) / BUILDER_STATE_COUNT as f32
    }

    /// Runs the builder until either `deadline` passes or the build
    /// completes, whichever comes first.
    pub fn next(&mut self, deadline: Instant) -> Result<BuilderStatus, CoreError> {
        while Instant::now() < deadline && self.state != BuilderState::Done {
            let finished = self.step(deadline)?;
            if finished {
                debug!("builder state {:?} complete", self.state);
                self.cursor = 0;
                self.state = self.state.next();
            }
        }
        Ok(BuilderStatus {
            state: self.state,
            percent: self.percent(),
        })
    }

    /// Convenience for callers (tests, a synchronous CLI) that do not
    /// need to interleave the build with anything else.
    pub fn run_to_completion(&mut self) -> Result<(), CoreError> {
        loop {
            let deadline = Instant::now() + std::time::Duration::from_secs(60);
            let status = self.next(deadline)?;
            if status.state == BuilderState::Done {
                return Ok(());
            }
        }
    }

    fn step(&mut self, deadline: Instant) -> Result<bool, CoreError> {
        match self.state {
            BuilderState::CreateAttributes => self.step_create_attributes(),
            BuilderState::CopyVlr => self.step_copy_vlr(),
            BuilderState::CopyPoints => self.step_copy_points(deadline),
            BuilderState::CopyEvlr => self.step_copy_evlr(),
            BuilderState::Move => self.step_move(),
            BuilderState::Copy => self.step_copy(),
            BuilderState::CopyAttributes => self.step_copy_attributes(),
            BuilderState::MainBegin => self.step_main_begin(),
            BuilderState::MainInsert => self.step_main_insert(deadline),
            BuilderState::MainEnd => self.step_main_end(),
            BuilderState::MainSort => self.step_main_sort(deadline),
            BuilderState::NodeInsert => self.step_node_insert(deadline),
            BuilderState::NodeEnd => self.step_node_end(),
            BuilderState::End => self.step_end(),
            BuilderState::Done => Ok(true),
        }
    }

    fn step_create_attributes(&mut self) -> Result<bool, CoreError> {
        let path = side_stream_path(&self.tmp1_path, SIDE_EXT);
        let mut side = SideStream::create(&path)?;
        side.append_default(self.point_count)?;
        Ok(true)
    }

    fn step_copy_vlr(&mut self) -> Result<bool, CoreError> {
        PointFile::create(&self.tmp1_path, self.dst_header.clone(), self.dst_format)?;
        copy_byte_range(
            &self.input_path,
            &self.tmp1_path,
            self.src_header.header_size as u64,
            self.dst_header.header_size as u64,
            (self.src_header.offset_to_point_data as u64).saturating_sub(self.src_header.header_size as u64),
        )?;
        Ok(true)
    }

    fn step_copy_points(&mut self, deadline: Instant) -> Result<bool, CoreError> {
        let mut src = PointFile::open(&self.input_path)?;
        let mut dst = PointFile::open(&self.tmp1_path)?;

        let src_fixed_len = self.src_format.record_length()? as usize;
        let dst_fixed_len = self.dst_format.record_length()? as usize;
        let extra = self.extra_bytes as usize;

        let mut src_buf = vec![0u8; src_fixed_len + extra];
        let mut dst_buf = vec![0u8; dst_fixed_len + extra];

        while self.cursor < self.point_count {
            src.read_raw_record(self.cursor, &mut src_buf)?;
            for b in dst_buf.iter_mut() {
                *b = 0;
            }
            format_point(self.src_format, self.dst_format, &src_buf[..src_fixed_len], &mut dst_buf[..dst_fixed_len]);
            if extra > 0 {
                dst_buf[dst_fixed_len..].copy_from_slice(&src_buf[src_fixed_len..]);
            }

            let x = self.src_header.x_offset + i32::from_le_bytes(src_buf[0..4].try_into().unwrap()) as f64 * self.src_header.x_scale_factor;
            let y = self.src_header.y_offset + i32::from_le_bytes(src_buf[4..8].try_into().unwrap()) as f64 * self.src_header.y_scale_factor;
            let z = self.src_header.z_offset + i32::from_le_bytes(src_buf[8..12].try_into().unwrap()) as f64 * self.src_header.z_scale_factor;
            self.points_box.extend(&Point3::new(x, y, z));

            let intensity = u16::from_le_bytes(src_buf[12..14].try_into().unwrap());
            self.intensity_max = self.intensity_max.max(intensity);

            if let Some(off) = color_offset(self.dst_format) {
                let r = u16::from_le_bytes(dst_buf[off..off + 2].try_into().unwrap());
                let g = u16::from_le_bytes(dst_buf[off + 2..off + 4].try_into().unwrap());
                let b = u16::from_le_bytes(dst_buf[off + 4..off + 6].try_into().unwrap());
                self.rgb_sum_max = self.rgb_sum_max.max(r as u32 + g as u32 + b as u32);
            }

            let dst_ordinal = if self.settings.randomize_points {
                randomized_ordinal(self.cursor, self.point_count, self.settings.max_index_l1_size)
            } else {
                self.cursor
            };
            dst.write_raw_record(dst_ordinal, &dst_buf)?;

            self.cursor += 1;
            if self.cursor % 1024 == 0 && Instant::now() >= deadline {
                return Ok(false);
            }
        }
        drop(src);
        drop(dst);

        if let Some(b) = self.points_box.into_aabb() {
            self.dst_header.max_x = b.max().x;
            self.dst_header.min_x = b.min().x;
            self.dst_header.max_y = b.max().y;
            self.dst_header.min_y = b.min().y;
            self.dst_header.max_z = b.max().z;
            self.dst_header.min_z = b.min().z;
        }
        let mut f = OpenOptions::new()
            .write(true)
            .open(&self.tmp1_path)
            .map_err(|e| CoreError::io(&self.tmp1_path, e))?;
        self.dst_header
            .clone()
            .write_to(&mut f)
            .map_err(|e| CoreError::io(&self.tmp1_path, e))?;

        debug!(
            "copy_points: observed intensity_max={} rgb_sum_max={}",
            self.intensity_max, self.rgb_sum_max
        );
        Ok(true)
    }

    fn step_copy_evlr(&mut self) -> Result<bool, CoreError> {
        copy_trailing_bytes(
            &self.input_path,
            self.src_header.offset_to_point_data as u64 + self.src_header.point_data_record_length as u64 * self.point_count,
            &self.tmp1_path,
            self.dst_header.offset_to_point_data as u64 + self.dst_header.point_data_record_length as u64 * self.point_count,
        )
    }

    fn step_move(&mut self) -> Result<bool, CoreError> {
        // The format-upgraded first pass at `tmp1_path` becomes the input
        // to the page-building pass below. Kept in place rather than
        // renamed onto a third path - a single process never needs the
        // crash-recovery this promotion step exists for upstream.
        debug!("promoted {:?} as the page-building input", self.tmp1_path);
        Ok(true)
    }

    fn step_copy(&mut self) -> Result<bool, CoreError> {
        PointFile::create(&self.tmp2_path, self.dst_header.clone(), self.dst_format)?;
        copy_byte_range(
            &self.tmp1_path,
            &self.tmp2_path,
            self.dst_header.header_size as u64,
            self.dst_header.header_size as u64,
            (self.dst_header.offset_to_point_data as u64).saturating_sub(self.dst_header.header_size as u64),
        )?;
        Ok(true)
    }

    fn step_copy_attributes(&mut self) -> Result<bool, CoreError> {
        let from = side_stream_path(&self.tmp1_path, SIDE_EXT);
        let to = side_stream_path(&self.tmp2_path, SIDE_EXT);
        fs::copy(&from, &to).map_err(|e| CoreError::io(&to, e))?;
        Ok(true)
    }

    fn step_main_begin(&mut self) -> Result<bool, CoreError> {
        let observed = self
            .points_box
            .into_aabb()
            .unwrap_or_else(|| Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.0, 0.0)));
        let side = observed.length(0).max(observed.length(1)).max(observed.length(2));
        let half = side / 2.0;
        let center = observed.center();
        let cube = Aabb::new(
            Point3::new(center.x - half, center.y - half, center.z - half),
            Point3::new(center.x + half, center.y + half, center.z + half),
        );
        info!("coarse index cube: {cube:?}");
        self.coarse = Some(Octree::build_begin(
            cube,
            self.settings.max_index_l1_size,
            self.settings.max_index_l1_level,
            false,
        ));
        Ok(true)
    }

    fn step_main_insert(&mut self, deadline: Instant) -> Result<bool, CoreError> {
        let mut points = PointFile::open(&self.tmp1_path)?;
        let octree = self.coarse.as_mut().expect("coarse octree initialized at MAIN_BEGIN");
        while self.cursor < self.point_count {
            let p = points.read_point(self.cursor)?;
            octree.insert(p.position);
            self.cursor += 1;
            if self.cursor % 1024 == 0 && Instant::now() >= deadline {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn step_main_end(&mut self) -> Result<bool, CoreError> {
        let octree = self.coarse.as_mut().expect("coarse octree initialized at MAIN_BEGIN");
        octree.build_end();
        octree.validate()?;

        let chunk = write_octree(&self.sidecar_path, octree)?;
        let mut file = File::create(&self.sidecar_path).map_err(|e| CoreError::io(&self.sidecar_path, e))?;
        chunk.write_to(&self.sidecar_path, &mut file)?;
        self.sidecar_first_chunk_len = 16 + chunk.data.len() as u64;
        self.leaves = octree.pages();
        info!("coarse index compiled: {} nodes, {} pages", octree.len(), self.leaves.len());
        Ok(true)
    }

    fn step_main_sort(&mut self, deadline: Instant) -> Result<bool, CoreError> {
        let octree = self.coarse.as_ref().expect("coarse octree built at MAIN_END");
        let mut src_points = PointFile::open(&self.tmp1_path)?;
        let mut src_sides = SideStream::open(side_stream_path(&self.tmp1_path, SIDE_EXT))?;
        let mut dst_points = PointFile::open(&self.tmp2_path)?;
        let mut dst_sides = SideStream::open(side_stream_path(&self.tmp2_path, SIDE_EXT))?;

        while self.cursor < self.point_count {
            let mut point = src_points.read_point(self.cursor)?;
            let attrs = src_sides.read(self.cursor)?;

            let leaf = octree.select_node_with_used(&mut self.used_coarse, &point.position);
            let node = octree.node(leaf);
            let used = *self.used_coarse.get(&leaf).unwrap_or(&0);
            let dest_ordinal = node.from + used - 1;

            if self.intensity_max > 0 && self.intensity_max < 256 {
                point.intensity = ((point.intensity as f64) / 255.0 * 65535.0).round() as u16;
            }
            if let Some((r, g, b)) = point.color {
                if self.rgb_sum_max > 0 && self.rgb_sum_max < 766 {
                    let rescale = |c: u16| ((c as f64) / 255.0 * 65535.0).round() as u16;
                    point.color = Some((rescale(r), rescale(g), rescale(b)));
                }
            }

            dst_points.write_point(dest_ordinal, &point)?;
            dst_sides.write(dest_ordinal, &attrs)?;

            self.cursor += 1;
            if self.cursor % 1024 == 0 && Instant::now() >= deadline {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn step_node_insert(&mut self, deadline: Instant) -> Result<bool, CoreError> {
        while (self.cursor as usize) < self.leaves.len() {
            let leaf_id = self.leaves[self.cursor as usize];
            self.process_leaf(leaf_id)?;
            self.cursor += 1;
            if Instant::now() >= deadline {
                return Ok((self.cursor as usize) >= self.leaves.len());
            }
        }
        Ok(true)
    }

    /// Builds the fine, in-page octree for one coarse page (a coarse
    /// node that owns points directly - usually but not always a true
    /// leaf) and sorts that page's point range in `tmp2` into the fine
    /// octree's Z-order. The fine octree itself is discarded once the
    /// reorder is applied: nothing outside this function ever reads it
    /// back, so it is not worth persisting.
    fn process_leaf(&mut self, leaf_id: NodeId) -> Result<(), CoreError> {
        let (from, size) = {
            let octree = self.coarse.as_ref().expect("coarse octree built at MAIN_END");
            let node = octree.node(leaf_id);
            (node.from, node.size)
        };

        if size == 0 {
            return Ok(());
        }

        let mut points_file = PointFile::open(&self.tmp2_path)?;
        let mut sides_file = SideStream::open(side_stream_path(&self.tmp2_path, SIDE_EXT))?;

        let mut points = Vec::with_capacity(size as usize);
        let mut sides = Vec::with_capacity(size as usize);
        for ordinal in from..from + size {
            points.push(points_file.read_point(ordinal)?);
            sides.push(sides_file.read(ordinal)?);
        }

        let mut bbox = OptionAabb::empty();
        for p in &points {
            bbox.extend(&p.position);
        }
        let bbox = bbox.into_aabb().unwrap_or_else(|| Aabb::new(points[0].position, points[0].position));

        let mut fine = Octree::build_begin(bbox, self.settings.max_index_l2_size, self.settings.max_index_l2_level, true);
        let settled: Vec<NodeId> = points.iter().map(|p| fine.insert(p.position)).collect();
        fine.build_end();

        let mut used = HashMap::new();
        let mut reordered_points = points.clone();
        let mut reordered_sides = sides.clone();
        for (i, &leaf) in settled.iter().enumerate() {
            let node = fine.node(leaf);
            let consumed = used.entry(leaf).or_insert(0u64);
            let local = node.from + *consumed;
            *consumed += 1;
            reordered_points[local as usize] = points[i];
            reordered_sides[local as usize] = sides[i];
        }

        for (i, (p, a)) in reordered_points.iter().zip(reordered_sides.iter()).enumerate() {
            let ordinal = from + i as u64;
            points_file.write_point(ordinal, p)?;
            sides_file.write(ordinal, a)?;
        }

        Ok(())
    }

    /// The coarse octree chunk written at `MAIN_END` never changes after
    /// `NODE_INSERT` runs - the fine octrees it used to point leaves at
    /// are no longer persisted - so this step only re-validates it rather
    /// than rewriting it.
    fn step_node_end(&mut self) -> Result<bool, CoreError> {
        let octree = self.coarse.as_ref().expect("coarse octree built at MAIN_END");
        let chunk = write_octree(&self.sidecar_path, octree)?;
        debug_assert_eq!(16 + chunk.data.len() as u64, self.sidecar_first_chunk_len);
        Ok(true)
    }

    fn step_end(&mut self) -> Result<bool, CoreError> {
        // The trailing (EVLR) bytes beyond the point section were only
        // carried into the first pass's file; fold them into the final
        // output now that its point section length is settled.
        let trailing = self.dst_header.offset_to_point_data as u64 + self.dst_header.point_data_record_length as u64 * self.point_count;
        copy_trailing_bytes(&self.tmp1_path, trailing, &self.tmp2_path, trailing)?;

        fs::rename(&self.tmp2_path, &self.points_path).map_err(|e| CoreError::io(&self.points_path, e))?;
        fs::rename(side_stream_path(&self.tmp2_path, SIDE_EXT), side_stream_path(&self.points_path, SIDE_EXT))
            .map_err(|e| CoreError::io(&self.points_path, e))?;

        let _ = fs::remove_file(&self.tmp1_path);
        let _ = fs::remove_file(side_stream_path(&self.tmp1_path, SIDE_EXT));

        if let Some(data_dir) = self.points_path.parent() {
            self.settings.save_to_data_folder(data_dir).map_err(|e| {
                CoreError::io(
                    data_dir.join("settings.json"),
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;
        }

        info!("build complete: {} points across {} pages", self.point_count, self.leaves.len());
        Ok(true)
    }
}

/// Maps a source point ordinal `i` (of `n` total) to a decorrelated
/// destination ordinal, striding by `skip = ceil(n / max_l1_size)`
/// columns so that a contiguous run of input ordinals lands spread
/// roughly `n / skip` ordinals apart in the output - the `randomize_points`
/// option from `COPY_POINTS` (see the module docs). Columns are laid out
/// back to back in the output (column 0's rows, then column 1's, ...),
/// which is a bijection on `[0, n)` regardless of whether `n` divides
/// evenly by `skip`.
fn randomized_ordinal(i: u64, n: u64, max_l1_size: u64) -> u64 {
    if n == 0 || max_l1_size == 0 {
        return i;
    }
    let skip = (n + max_l1_size - 1) / max_l1_size;
    let skip = skip.max(1).min(n);
    let column = i % skip;
    let row = i / skip;
    let base_rows = n / skip;
    let extra_columns = n % skip;
    let offset = if column <= extra_columns {
        column * (base_rows + 1)
    } else {
        extra_columns * (base_rows + 1) + (column - extra_columns) * base_rows
    };
    offset + row
}

fn color_offset(format: PointFormat) -> Option<usize> {
    if format.is_extended() {
        extended_rgb_offset(format)
    } else {
        legacy_rgb_offset(format)
    }
}

fn copy_byte_range(src_path: &Path, dst_path: &Path, src_offset: u64, dst_offset: u64, len: u64) -> Result<(), CoreError> {
    if len == 0 {
        return Ok(());
    }
    let mut src = File::open(src_path).map_err(|e| CoreError::io(src_path, e))?;
    src.seek(SeekFrom::Start(src_offset)).map_err(|e| CoreError::io(src_path, e))?;
    let mut buf = vec![0u8; len as usize];
    src.read_exact(&mut buf).map_err(|e| CoreError::io(src_path, e))?;

    let mut dst = OpenOptions::new()
        .write(true)
        .open(dst_path)
        .map_err(|e| CoreError::io(dst_path, e))?;
    dst.seek(SeekFrom::Start(dst_offset)).map_err(|e| CoreError::io(dst_path, e))?;
    dst.write_all(&buf).map_err(|e| CoreError::io(dst_path, e))
}

/// Copies everything from `src_start` to end-of-file in `src_path` to
/// `dst_start` in `dst_path`, if any such bytes exist. Used for the
/// extended variable length records that may trail the point section.
fn copy_trailing_bytes(src_path: &Path, src_start: u64, dst_path: &Path, dst_start: u64) -> Result<(), CoreError> {
    let mut src = File::open(src_path).map_err(|e| CoreError::io(src_path, e))?;
    let src_len = src.metadata().map_err(|e| CoreError::io(src_path, e))?.len();
    if src_len <= src_start {
        return Ok(());
    }
    src.seek(SeekFrom::Start(src_start)).map_err(|e| CoreError::io(src_path, e))?;
    let mut buf = Vec::new();
    src.read_to_end(&mut buf).map_err(|e| CoreError::io(src_path, e))?;

    let mut dst = OpenOptions::new()
        .write(true)
        .open(dst_path)
        .map_err(|e| CoreError::io(dst_path, e))?;
    dst.seek(SeekFrom::Start(dst_start)).map_err(|e| CoreError::io(dst_path, e))?;
    dst.write_all(&buf).map_err(|e| CoreError::io(dst_path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::record::PointRecord;
    use las::point::Format as LasFormat;
    use las::raw::point::{Flags, ScanAngle};
    use las::raw::Point as RawPoint;

    /// Writes a minimal, valid point-format-3 LAS file with `points`
    /// written in order, for use as builder input.
    fn write_test_las(path: &Path, points: &[(Point3<f64>, u16)]) {
        let mut header = Header::default();
        header.version = las::Version::new(1, 2);
        header.point_data_record_format = 3;
        header.point_data_record_length = PointFormat(3).record_length().unwrap();
        header.header_size = header.version.header_size();
        header.offset_to_point_data = header.header_size as u32;
        header.x_scale_factor = 0.001;
        header.y_scale_factor = 0.001;
        header.z_scale_factor = 0.001;
        header.x_offset = 0.0;
        header.y_offset = 0.0;
        header.z_offset = 0.0;
        header.number_of_point_records = points.len() as u32;
        header.number_of_points_by_return = [points.len() as u32, 0, 0, 0, 0];

        let mut file = File::create(path).unwrap();
        header.clone().write_to(&mut file).unwrap();

        let format = LasFormat::new(3).unwrap();
        for (position, intensity) in points {
            let raw = RawPoint {
                x: (position.x / header.x_scale_factor).round() as i32,
                y: (position.y / header.y_scale_factor).round() as i32,
                z: (position.z / header.z_scale_factor).round() as i32,
                intensity: *intensity,
                flags: Flags::TwoByte(0b0010_0000, 2),
                scan_angle: ScanAngle::Rank(0),
                user_data: 0,
                point_source_id: 0,
                color: Some(las::Color::new(10, 20, 30)),
                ..Default::default()
            };
            raw.write_to(&mut file, &format).unwrap();
        }
    }

    #[test]
    fn builds_a_tiny_index_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.las");
        let points: Vec<(Point3<f64>, u16)> = (0..40)
            .map(|i| (Point3::new((i % 4) as f64, (i / 4 % 4) as f64, (i / 16) as f64), 100 + i as u16))
            .collect();
        write_test_las(&input, &points);

        let data_dir = dir.path().join("index");
        let settings = Settings {
            max_index_l1_size: 8,
            max_index_l1_level: 6,
            max_index_l2_size: 4,
            max_index_l2_level: 4,
            ..Settings::default()
        };
        let mut builder = IndexBuilder::new(settings, input, &data_dir).unwrap();
        builder.run_to_completion().unwrap();

        assert!(builder.points_path().exists());
        assert!(builder.sidecar_path().exists());

        let mut pf = PointFile::open(builder.points_path()).unwrap();
        assert_eq!(pf.len(), points.len() as u64);

        let mut seen: Vec<PointRecord> = Vec::new();
        for i in 0..pf.len() {
            seen.push(pf.read_point(i).unwrap());
        }
        for (original, _) in &points {
            assert!(seen.iter().any(|p| (p.position - original).norm() < 1e-6));
        }
    }

    #[test]
    fn percent_is_monotonic_across_steps() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.las");
        let points: Vec<(Point3<f64>, u16)> = (0..20).map(|i| (Point3::new(i as f64, 0.0, 0.0), 50)).collect();
        write_test_las(&input, &points);

        let mut builder = IndexBuilder::new(Settings::default(), input, dir.path().join("index")).unwrap();
        let mut last = 0.0f32;
        loop {
            let status = builder.next(Instant::now() + std::time::Duration::from_millis(5)).unwrap();
            assert!(status.percent >= last);
            last = status.percent;
            if status.state == BuilderState::Done {
                break;
            }
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn randomized_ordinal_is_a_bijection() {
        let n = 37u64;
        let max_l1_size = 8u64;
        let mut seen = vec![false; n as usize];
        for i in 0..n {
            let d = randomized_ordinal(i, n, max_l1_size);
            assert!(d < n);
            assert!(!seen[d as usize], "destination {d} hit twice");
            seen[d as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn randomized_ordinal_spreads_contiguous_runs() {
        // with n=40, max_l1_size=8, skip=ceil(40/8)=5: consecutive source
        // ordinals land a full column-width (8 slots) apart.
        assert_eq!(randomized_ordinal(0, 40, 8), 0);
        assert_eq!(randomized_ordinal(1, 40, 8), 8);
        assert_eq!(randomized_ordinal(2, 40, 8), 16);
    }

    #[test]
    fn randomize_points_still_yields_every_input_point() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.las");
        let points: Vec<(Point3<f64>, u16)> = (0..40)
            .map(|i| (Point3::new((i % 4) as f64, (i / 4 % 4) as f64, (i / 16) as f64), 100 + i as u16))
            .collect();
        write_test_las(&input, &points);

        let settings = Settings {
            randomize_points: true,
            max_index_l1_size: 8,
            max_index_l1_level: 6,
            max_index_l2_size: 4,
            max_index_l2_level: 4,
            ..Settings::default()
        };
        let mut builder = IndexBuilder::new(settings, input, dir.path().join("index")).unwrap();
        builder.run_to_completion().unwrap();

        let mut pf = PointFile::open(builder.points_path()).unwrap();
        assert_eq!(pf.len(), points.len() as u64);
        let seen: Vec<PointRecord> = (0..pf.len()).map(|i| pf.read_point(i).unwrap()).collect();
        for (original, _) in &points {
            assert!(seen.iter().any(|p| (p.position - original).norm() < 1e-6));
        }
    }
}
