//! The external point-record file: a standard LAS/LAZ file for the typed
//! point fields, plus four small fixed-record side-stream files for the
//! per-point attributes the wire format doesn't carry (segment id,
//! elevation, descriptor, voxel back-reference).
//!
//! Header parsing and the fixed point-record layout are delegated to the
//! `las` crate (`las::raw::Header`, `las::raw::Point`) rather than
//! hand-rolled, matching how every LAS-capable sibling crate in this
//! codebase reads and writes LAS files. The one piece of LAS handling that
//! crate does not provide - rewriting a point record from one format into
//! another - is implemented in [crate::point::upgrade].

use crate::error::CoreError;
use crate::point::format::PointFormat;
use crate::point::record::{PointRecord, SideAttributes};
use las::point::Format;
use las::raw::point::{Flags, ScanAngle};
use las::raw::{Header, Point as RawPoint};
use nalgebra::Point3;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A point-record file opened for random access: the header has been
/// parsed once, and point records are read/written by seeking to
/// `offset_to_point_data + ordinal * point_data_record_length`.
pub struct PointFile {
    path: PathBuf,
    file: File,
    header: Header,
    format: Format,
    point_format: PointFormat,
}

impl PointFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_owned();
        let mut file = File::open(&path).map_err(|e| CoreError::io(&path, e))?;
        let header = Header::read_from(&mut file).map_err(CoreError::from)?;
        let point_format = PointFormat(header.point_data_record_format & 0x7F);
        let format =
            Format::new(point_format.0).map_err(|e: las::Error| CoreError::from(e))?;
        Ok(PointFile {
            path,
            file,
            header,
            format,
            point_format,
        })
    }

    pub fn create(
        path: impl AsRef<Path>,
        header: Header,
        point_format: PointFormat,
    ) -> Result<Self, CoreError> {
        let path = path.as_ref().to_owned();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| CoreError::io(&path, e))?;
        header
            .clone()
            .write_to(&mut file)
            .map_err(|e| CoreError::io(&path, e))?;
        let format = Format::new(point_format.0).map_err(|e: las::Error| CoreError::from(e))?;
        Ok(PointFile {
            path,
            file,
            header,
            format,
            point_format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn point_format(&self) -> PointFormat {
        self.point_format
    }

    pub fn len(&self) -> u64 {
        self.header.number_of_point_records as u64
    }

    fn record_offset(&self, ordinal: u64) -> u64 {
        self.header.offset_to_point_data as u64
            + ordinal * self.header.point_data_record_length as u64
    }

    /// Reads the raw, still-encoded record bytes for one point. Used by
    /// the builder's copy passes, which rewrite records between formats
    /// without fully decoding them (see [crate::point::upgrade]).
    pub fn read_raw_record(&mut self, ordinal: u64, buf: &mut [u8]) -> Result<(), CoreError> {
        debug_assert_eq!(buf.len(), self.header.point_data_record_length as usize);
        self.file
            .seek(SeekFrom::Start(self.record_offset(ordinal)))
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.file
            .read_exact(buf)
            .map_err(|e| CoreError::io(&self.path, e))
    }

    pub fn write_raw_record(&mut self, ordinal: u64, buf: &[u8]) -> Result<(), CoreError> {
        debug_assert_eq!(buf.len(), self.header.point_data_record_length as usize);
        self.file
            .seek(SeekFrom::Start(self.record_offset(ordinal)))
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.file
            .write_all(buf)
            .map_err(|e| CoreError::io(&self.path, e))
    }

    pub fn read_point(&mut self, ordinal: u64) -> Result<PointRecord, CoreError> {
        self.file
            .seek(SeekFrom::Start(self.record_offset(ordinal)))
            .map_err(|e| CoreError::io(&self.path, e))?;
        let raw = RawPoint::read_from(&mut self.file, &self.format).map_err(CoreError::from)?;
        Ok(decode_point(&raw, &self.header, self.point_format))
    }

    pub fn write_point(&mut self, ordinal: u64, point: &PointRecord) -> Result<(), CoreError> {
        let raw = encode_point(point, &self.header, self.point_format);
        self.file
            .seek(SeekFrom::Start(self.record_offset(ordinal)))
            .map_err(|e| CoreError::io(&self.path, e))?;
        raw.write_to(&mut self.file, &self.format)
            .map_err(|e| CoreError::io(&self.path, e))
    }
}

fn decode_point(raw: &RawPoint, header: &Header, format: PointFormat) -> PointRecord {
    let position = Point3::new(
        header.x_offset + raw.x as f64 * header.x_scale_factor,
        header.y_offset + raw.y as f64 * header.y_scale_factor,
        header.z_offset + raw.z as f64 * header.z_scale_factor,
    );
    let (return_number, number_of_returns, classification) = match raw.flags {
        Flags::TwoByte(b1, b2) => ((b1 & 0xE0) >> 5, (b1 & 0x1C) >> 2, b2),
        Flags::ThreeByte(b1, _b2, b3) => (b1 & 0x0F, (b1 & 0xF0) >> 4, b3),
    };
    let color = raw.color.map(|c| (c.red, c.green, c.blue));
    PointRecord {
        position,
        intensity: raw.intensity,
        return_number,
        number_of_returns,
        classification,
        user_data: raw.user_data,
        point_source_id: raw.point_source_id,
        gps_time: raw.gps_time,
        color: if format.has_color() { color } else { None },
    }
}

fn encode_point(point: &PointRecord, header: &Header, format: PointFormat) -> RawPoint {
    let x = ((point.position.x - header.x_offset) / header.x_scale_factor).round() as i32;
    let y = ((point.position.y - header.y_offset) / header.y_scale_factor).round() as i32;
    let z = ((point.position.z - header.z_offset) / header.z_scale_factor).round() as i32;
    let flags = if format.is_extended() {
        Flags::ThreeByte(
            (point.return_number & 0x0F) | ((point.number_of_returns & 0x0F) << 4),
            0,
            point.classification,
        )
    } else {
        Flags::TwoByte(
            ((point.return_number & 0x07) << 5) | ((point.number_of_returns & 0x07) << 2),
            point.classification,
        )
    };
    RawPoint {
        x,
        y,
        z,
        intensity: point.intensity,
        flags,
        scan_angle: ScanAngle::Rank(0),
        user_data: point.user_data,
        point_source_id: point.point_source_id,
        gps_time: point.gps_time,
        color: point.color.map(|(r, g, b)| las::Color::new(r, g, b)),
        ..Default::default()
    }
}

/// A fixed-record-length side file carrying one [SideAttributes] field per
/// point ordinal, read/written independently of the LAS file itself.
pub struct SideStream {
    file: File,
    path: PathBuf,
}

const SIDE_RECORD_LEN: usize = 16; // i32 + f32 + f32 + u32

impl SideStream {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| CoreError::io(&path, e))?;
        Ok(SideStream { file, path })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CoreError::io(&path, e))?;
        Ok(SideStream { file, path })
    }

    pub fn read(&mut self, ordinal: u64) -> Result<SideAttributes, CoreError> {
        self.file
            .seek(SeekFrom::Start(ordinal * SIDE_RECORD_LEN as u64))
            .map_err(|e| CoreError::io(&self.path, e))?;
        let mut buf = [0u8; SIDE_RECORD_LEN];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| CoreError::io(&self.path, e))?;
        Ok(SideAttributes {
            segment_id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            elevation: f32::from_le_bytes(buf[4..8].try_into().unwrap()),
            descriptor: f32::from_le_bytes(buf[8..12].try_into().unwrap()),
            voxel: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    pub fn write(&mut self, ordinal: u64, attrs: &SideAttributes) -> Result<(), CoreError> {
        let mut buf = [0u8; SIDE_RECORD_LEN];
        buf[0..4].copy_from_slice(&attrs.segment_id.to_le_bytes());
        buf[4..8].copy_from_slice(&attrs.elevation.to_le_bytes());
        buf[8..12].copy_from_slice(&attrs.descriptor.to_le_bytes());
        buf[12..16].copy_from_slice(&attrs.voxel.to_le_bytes());
        self.file
            .seek(SeekFrom::Start(ordinal * SIDE_RECORD_LEN as u64))
            .map_err(|e| CoreError::io(&self.path, e))?;
        self.file
            .write_all(&buf)
            .map_err(|e| CoreError::io(&self.path, e))
    }

    pub fn append_default(&mut self, count: u64) -> Result<(), CoreError> {
        let mut writer = BufWriter::new(&mut self.file);
        writer
            .seek(SeekFrom::End(0))
            .map_err(|e| CoreError::io(&self.path, e))?;
        let default = SideAttributes::default();
        let mut buf = [0u8; SIDE_RECORD_LEN];
        buf[0..4].copy_from_slice(&default.segment_id.to_le_bytes());
        buf[4..8].copy_from_slice(&default.elevation.to_le_bytes());
        buf[8..12].copy_from_slice(&default.descriptor.to_le_bytes());
        buf[12..16].copy_from_slice(&default.voxel.to_le_bytes());
        for _ in 0..count {
            writer
                .write_all(&buf)
                .map_err(|e| CoreError::io(&self.path, e))?;
        }
        Ok(())
    }
}

/// Convenience wrapper opening the four side streams that live alongside
/// one point file, named `<stem>.segment`, `.elevation`, `.descriptor`,
/// `.voxel` the way [PointFile] itself corresponds to `<stem>.las`.
pub fn side_stream_path(point_file: &Path, extension: &str) -> PathBuf {
    point_file.with_extension(extension)
}

pub fn open_buffered_reader(path: impl AsRef<Path>) -> Result<BufReader<File>, CoreError> {
    let path = path.as_ref();
    Ok(BufReader::new(
        File::open(path).map_err(|e| CoreError::io(path, e))?,
    ))
}
