//! Byte-exact remapping between the "legacy" LAS point-data-record formats
//! (0-5, an 8-bit return/flags bitfield and a combined classification byte)
//! and the "extended" formats (6-10, a 16-bit flags field, a full-range
//! classification byte, a wider scan angle, and a scanner channel).
//!
//! This is the one place in the point format where no existing crate does
//! the work for us: the `las` crate reads and writes a single format, it
//! does not convert between them. The bit layouts below are lifted
//! directly from the upgrade/downgrade extractors of an LAS-aware sibling
//! project and cross-checked against the byte-for-byte remap performed by
//! the file-index builder this crate's format is descended from.

use super::format::PointFormat;

/// Upgrades an 8-bit legacy `{return_number(3) | number_of_returns(3) |
/// scan_direction(1) | edge_of_flight_line(1)}` bitfield into the 16-bit
/// extended `[return_number(4) | number_of_returns(4), classification_flags(4)
/// | scanner_channel(2) | scan_direction(1) | edge_of_flight_line(1)]` pair.
/// Classification flags and scanner channel are left at zero; callers that
/// also need to migrate the synthetic/key-point/withheld bits out of the
/// legacy classification byte OR those bits into the high nibble of the
/// first returned byte afterwards.
pub fn upgrade_flags(basic_flags: u8) -> [u8; 2] {
    let mut byte1: u8 = basic_flags & 0x07;
    byte1 |= (basic_flags & 0x38) << 1;
    let byte2 = basic_flags & 0xC0;
    [byte1, byte2]
}

/// Downgrades the extended 16-bit flags pair back into the legacy 8-bit
/// bitfield, saturating return number and number-of-returns at 7 (the
/// legacy format has no representation for the extended formats' full
/// 0-15 range).
pub fn downgrade_flags(extended_flags: [u8; 2]) -> u8 {
    let byte1 = extended_flags[0];
    let byte2 = extended_flags[1];

    let mut return_number = byte1 & 0x0F;
    if return_number >= 8 {
        return_number = 7;
    }
    let mut flags = return_number;

    let mut number_of_returns = (byte1 & 0xF0) >> 4;
    if number_of_returns >= 8 {
        number_of_returns = 7;
    }
    flags |= number_of_returns << 3;

    flags |= byte2 & 0xC0;
    flags
}

/// Rescales a legacy 8-bit scan angle rank (signed, approximately in units
/// of one degree) into the extended 16-bit scan angle (signed, in units of
/// 0.006 degrees), clamped to the range the extended field can represent.
pub fn upgrade_scan_angle(rank: i8) -> i16 {
    let scaled = (rank as f64) * 166.666667;
    scaled.round().clamp(-15000.0, 15000.0) as i16
}

/// Inverse of [upgrade_scan_angle]; lossy, used when downgrading.
pub fn downgrade_scan_angle(scan_angle: i16) -> i8 {
    let scaled = (scan_angle as f64) / 166.666667;
    scaled.round().clamp(-90.0, 90.0) as i8
}

pub(crate) fn legacy_rgb_offset(format: PointFormat) -> Option<usize> {
    match format.0 {
        2 => Some(20),
        3 => Some(28),
        5 => Some(34),
        _ => None,
    }
}

fn legacy_waveform_offset(format: PointFormat) -> Option<usize> {
    match format.0 {
        4 => Some(28),
        5 => Some(34),
        _ => None,
    }
}

pub(crate) fn extended_rgb_offset(format: PointFormat) -> Option<usize> {
    match format.0 {
        7 | 8 | 10 => Some(30),
        _ => None,
    }
}

fn extended_nir_offset(format: PointFormat) -> Option<usize> {
    match format.0 {
        8 => Some(36),
        10 => Some(36),
        _ => None,
    }
}

fn extended_waveform_offset(format: PointFormat) -> Option<usize> {
    match format.0 {
        9 => Some(30),
        10 => Some(38),
        _ => None,
    }
}

const WAVEFORM_RECORD_LEN: usize = 29;

/// Rewrites one point record from `src_format` into `dst_format`.
///
/// `src` and `dst` must be exactly `src_format.record_length()` and
/// `dst_format.record_length()` bytes respectively; `dst` is assumed to be
/// zero-initialized (any destination field with no corresponding source
/// field, e.g. a synthesized NIR channel, is left at zero).
///
/// Only transitions between a legacy and its corresponding extended format
/// (and the identity transition) are supported; this matches the only
/// conversions the builder ever performs (`convert_to_version_1_4`).
pub fn format_point(src_format: PointFormat, dst_format: PointFormat, src: &[u8], dst: &mut [u8]) {
    assert_eq!(src.len(), src_format.record_length().unwrap() as usize);
    assert_eq!(dst.len(), dst_format.record_length().unwrap() as usize);

    // x, y, z, intensity: identical layout at the front of every format.
    dst[0..14].copy_from_slice(&src[0..14]);

    match (src_format.is_extended(), dst_format.is_extended()) {
        (false, true) => upgrade_point(src_format, dst_format, src, dst),
        (true, false) => downgrade_point(src_format, dst_format, src, dst),
        _ => {
            assert_eq!(src_format.0, dst_format.0, "cross-format copy within the same point-record kind is not supported");
            dst.copy_from_slice(src);
        }
    }
}

fn upgrade_point(src_format: PointFormat, dst_format: PointFormat, src: &[u8], dst: &mut [u8]) {
    let basic_flags = src[14];
    let class_byte = src[15];
    let [ext0, mut ext1] = upgrade_flags(basic_flags);

    let classification = class_byte & 0x1F;
    // synthetic/key_point/withheld sit at bits 5-7 of the legacy byte and
    // move down to bits 0-2 of the extended classification-flags nibble.
    ext1 |= class_byte >> 5;

    dst[14] = ext0;
    dst[15] = ext1;
    dst[16] = classification;
    dst[17] = src[17]; // user data

    let rank = src[16] as i8;
    let scan_angle = upgrade_scan_angle(rank);
    dst[18..20].copy_from_slice(&scan_angle.to_le_bytes());
    dst[20..22].copy_from_slice(&src[18..20]); // point source id

    if dst_format.has_gps_time() && src_format.has_gps_time() {
        dst[22..30].copy_from_slice(&src[20..28]);
    }

    if let (Some(dst_off), Some(src_off)) =
        (extended_rgb_offset(dst_format), legacy_rgb_offset(src_format))
    {
        dst[dst_off..dst_off + 6].copy_from_slice(&src[src_off..src_off + 6]);
    }

    if let (Some(dst_off), Some(src_off)) = (
        extended_waveform_offset(dst_format),
        legacy_waveform_offset(src_format),
    ) {
        dst[dst_off..dst_off + WAVEFORM_RECORD_LEN]
            .copy_from_slice(&src[src_off..src_off + WAVEFORM_RECORD_LEN]);
    }

    // NIR has no legacy source; extended_nir_offset(dst_format) stays zeroed.
    let _ = extended_nir_offset(dst_format);
}

fn downgrade_point(src_format: PointFormat, dst_format: PointFormat, src: &[u8], dst: &mut [u8]) {
    let ext0 = src[14];
    let ext1 = src[15];
    let basic_flags = downgrade_flags([ext0, ext1]);

    let classification = src[16];
    // Mirror of upgrade_point: bits 0-2 of the extended classification-flags
    // nibble move back up to bits 5-7 of the legacy byte.
    let class_byte = (classification & 0x1F) | ((ext1 & 0x07) << 5);

    dst[14] = basic_flags;
    dst[15] = class_byte;

    let scan_angle = i16::from_le_bytes([src[18], src[19]]);
    dst[16] = downgrade_scan_angle(scan_angle) as u8;
    dst[17] = src[17]; // user data
    dst[18..20].copy_from_slice(&src[20..22]); // point source id

    if dst_format.has_gps_time() && src_format.has_gps_time() {
        dst[20..28].copy_from_slice(&src[22..30]);
    }

    if let (Some(dst_off), Some(src_off)) =
        (legacy_rgb_offset(dst_format), extended_rgb_offset(src_format))
    {
        dst[dst_off..dst_off + 6].copy_from_slice(&src[src_off..src_off + 6]);
    }

    if let (Some(dst_off), Some(src_off)) = (
        legacy_waveform_offset(dst_format),
        extended_waveform_offset(src_format),
    ) {
        dst[dst_off..dst_off + WAVEFORM_RECORD_LEN]
            .copy_from_slice(&src[src_off..src_off + WAVEFORM_RECORD_LEN]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_upgrade_matches_known_cases() {
        assert_eq!(upgrade_flags(0x00), [0x00, 0x00]);
        assert_eq!(upgrade_flags(0x01), [0x01, 0x00]);
        assert_eq!(upgrade_flags(0x0F), [0x17, 0x00]);
        assert_eq!(upgrade_flags(0x3F), [0x77, 0x00]);
        assert_eq!(upgrade_flags(0x7F), [0x77, 0x40]);
        assert_eq!(upgrade_flags(0xBF), [0x77, 0x80]);
        assert_eq!(upgrade_flags(0xFF), [0x77, 0xC0]);
    }

    #[test]
    fn flags_downgrade_matches_known_cases() {
        assert_eq!(downgrade_flags([0x00, 0x01]), 0x00);
        assert_eq!(downgrade_flags([0x0F, 0x05]), 0x07);
        assert_eq!(downgrade_flags([0xFF, 0x09]), 0x3F);
        assert_eq!(downgrade_flags([0xFF, 0xCC]), 0xFF);
    }

    #[test]
    fn flags_roundtrip_is_lossless_within_representable_range() {
        for basic in 0u8..=0xFF {
            let extended = upgrade_flags(basic);
            let back = downgrade_flags(extended);
            let return_number = basic & 0x07;
            let number_of_returns = (basic & 0x38) >> 3;
            if return_number <= 7 && number_of_returns <= 7 {
                assert_eq!(back, basic);
            }
        }
    }

    #[test]
    fn scan_angle_rescale_is_monotonic_and_bounded() {
        assert_eq!(upgrade_scan_angle(0), 0);
        assert!(upgrade_scan_angle(90) <= 15000);
        assert!(upgrade_scan_angle(-90) >= -15000);
        assert!(upgrade_scan_angle(90) > upgrade_scan_angle(0));
    }

    #[test]
    fn format_point_upgrade_preserves_position_and_intensity() {
        let src_format = PointFormat(3);
        let dst_format = PointFormat(7);
        let mut src = vec![0u8; src_format.record_length().unwrap() as usize];
        src[0..4].copy_from_slice(&100i32.to_le_bytes());
        src[12..14].copy_from_slice(&500u16.to_le_bytes());
        src[14] = 0x0F; // return 7, number of returns 1
        src[15] = 0b0010_0101; // classification 5, synthetic bit set
        src[16] = 45; // scan angle rank
        src[28..30].copy_from_slice(&1000u16.to_le_bytes()); // red
        let mut dst = vec![0u8; dst_format.record_length().unwrap() as usize];
        format_point(src_format, dst_format, &src, &mut dst);

        assert_eq!(&dst[0..4], &100i32.to_le_bytes());
        assert_eq!(&dst[12..14], &500u16.to_le_bytes());
        assert_eq!(dst[16], 5); // classification, flag bits moved out
        assert_eq!(dst[15] & 0x01, 0x01); // synthetic moved into the low classification-flags nibble
        assert_eq!(&dst[30..32], &1000u16.to_le_bytes()); // red channel relocated
    }

    #[test]
    fn format_point_upgrade_keeps_classification_flags_in_the_low_nibble() {
        let src_format = PointFormat(3);
        let dst_format = PointFormat(7);
        let mut src = vec![0u8; src_format.record_length().unwrap() as usize];
        src[14] = 0xC0; // scan direction + edge of flight line, no returns
        src[15] = 0xE0; // synthetic | key_point | withheld, classification 0
        let mut dst = vec![0u8; dst_format.record_length().unwrap() as usize];
        format_point(src_format, dst_format, &src, &mut dst);

        // synthetic/key_point/withheld land at bits 0-2, not 4-6.
        assert_eq!(dst[15] & 0x07, 0x07);
        // overlap flag (bit 3) and scanner channel (bits 4-5) are untouched
        // by the classification flags.
        assert_eq!(dst[15] & 0x38, 0x00);
        // scan direction / edge of flight line (bits 6-7), preserved from the
        // legacy byte, are not clobbered by the classification flag bits.
        assert_eq!(dst[15] & 0xC0, 0xC0);

        let mut back = vec![0u8; src_format.record_length().unwrap() as usize];
        format_point(dst_format, src_format, &dst, &mut back);
        assert_eq!(back[15], 0xE0);
        assert_eq!(back[14] & 0xC0, 0xC0);
    }
}
