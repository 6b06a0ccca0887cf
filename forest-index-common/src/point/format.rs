//! The fixed-length point-record formats used by the external point file
//! (see the wire format description in the crate's external interfaces).

use crate::error::FormatError;
use std::path::Path;

/// One of the eleven LAS point-data-record formats (0-10).
///
/// Formats 0-5 are the "legacy" formats: an 8-bit bitfield packs return
/// number, number of returns, scan direction and edge-of-flight-line, and
/// classification is a single byte with no dedicated flag bits. Formats
/// 6-10 ("extended") split those into a 16-bit flag field plus a separate
/// classification byte, widen scan angle to 16 bits, and add a scanner
/// channel field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PointFormat(pub u8);

impl PointFormat {
    pub fn is_extended(self) -> bool {
        self.0 >= 6
    }

    pub fn has_gps_time(self) -> bool {
        matches!(self.0, 1 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 10)
    }

    pub fn has_color(self) -> bool {
        matches!(self.0, 2 | 3 | 5 | 7 | 8 | 10)
    }

    pub fn has_nir(self) -> bool {
        matches!(self.0, 8 | 10)
    }

    pub fn has_waveform(self) -> bool {
        matches!(self.0, 4 | 5 | 9 | 10)
    }

    /// Length in bytes of one fixed point record in this format, not
    /// counting any trailing extra bytes.
    pub fn record_length(self) -> Result<u16, FormatError> {
        Ok(match self.0 {
            0 => 20,
            1 => 28,
            2 => 26,
            3 => 34,
            4 => 57,
            5 => 63,
            6 => 30,
            7 => 36,
            8 => 38,
            9 => 59,
            10 => 67,
            other => {
                return Err(FormatError {
                    path: Path::new("<point format>").to_owned(),
                    message: format!("unsupported point data record format {other}"),
                });
            }
        })
    }

    /// The extended-format counterpart that `upgrade_format` (see
    /// [crate::point::upgrade]) would convert this format to, when a
    /// conversion to LAS 1.4 is requested. Legacy formats that already
    /// carry colour (2,3) upgrade to the colour-carrying extended formats
    /// (7), and so on, matching the table the original file-index builder
    /// uses.
    pub fn upgraded(self) -> Option<PointFormat> {
        Some(PointFormat(match self.0 {
            0 | 1 => 6,
            2 | 3 => 7,
            4 => 9,
            5 => 10,
            6..=10 => self.0,
            _ => return None,
        }))
    }
}
