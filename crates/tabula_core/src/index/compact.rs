//! Element block compaction.
//!
//! Element blocks store sorted row ids packed to the smallest byte width
//! able to hold the block's largest value:
//!
//! | max value        | width |
//! |------------------|-------|
//! | `<= 0xFF`        | 1     |
//! | `<= 0xFFFF`      | 2     |
//! | `<= 0xFF_FFFF`   | 3     |
//! | otherwise        | 4     |
//!
//! Each element is written big-endian in exactly `width` bytes. The width
//! is stored next to the element count in the IndexBlock entry as
//! `count | width << 24`.

use crate::error::{CoreError, CoreResult};

/// Largest element count a packed count field can carry.
pub const MAX_BLOCK_ELEMENTS: usize = 0x00FF_FFFF;

/// Chooses the byte width for a block whose largest element is `max`.
#[must_use]
pub fn compaction_width(max: u32) -> u8 {
    if max <= 0xFF {
        1
    } else if max <= 0xFFFF {
        2
    } else if max <= 0x00FF_FFFF {
        3
    } else {
        4
    }
}

/// Packs `elements`, returning the bytes and the chosen width.
#[must_use]
pub fn encode_elements(elements: &[u32]) -> (Vec<u8>, u8) {
    let max = elements.iter().copied().max().unwrap_or(0);
    let width = compaction_width(max);
    let mut buf = Vec::with_capacity(elements.len() * width as usize);
    for &e in elements {
        let be = e.to_be_bytes();
        buf.extend_from_slice(&be[4 - width as usize..]);
    }
    (buf, width)
}

/// Unpacks `count` elements of `width` bytes each.
///
/// # Errors
///
/// Returns `Corruption` if the width is invalid or the data is too short.
pub fn decode_elements(data: &[u8], count: usize, width: u8) -> CoreResult<Vec<u32>> {
    if !(1..=4).contains(&width) {
        return Err(CoreError::corruption(format!(
            "invalid element width {width}"
        )));
    }
    let w = width as usize;
    if data.len() < count * w {
        return Err(CoreError::corruption(format!(
            "element block holds {} bytes, {count} elements of width {w} need {}",
            data.len(),
            count * w
        )));
    }

    let mut out = Vec::with_capacity(count);
    for chunk in data[..count * w].chunks_exact(w) {
        let mut be = [0u8; 4];
        be[4 - w..].copy_from_slice(chunk);
        out.push(u32::from_be_bytes(be));
    }
    Ok(out)
}

/// Packs an element count and width into one `i32`.
///
/// # Errors
///
/// Returns `InvalidOperation` if the count does not fit in 24 bits.
pub fn pack_count(count: usize, width: u8) -> CoreResult<i32> {
    if count > MAX_BLOCK_ELEMENTS {
        return Err(CoreError::invalid_operation(format!(
            "element block of {count} entries exceeds {MAX_BLOCK_ELEMENTS}"
        )));
    }
    Ok((count as u32 | u32::from(width) << 24) as i32)
}

/// Splits a packed count field into `(count, width)`.
#[must_use]
pub fn unpack_count(packed: i32) -> (usize, u8) {
    let raw = packed as u32;
    ((raw & 0x00FF_FFFF) as usize, (raw >> 24) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn width_thresholds() {
        assert_eq!(compaction_width(0), 1);
        assert_eq!(compaction_width(0xFF), 1);
        assert_eq!(compaction_width(0x100), 2);
        assert_eq!(compaction_width(0xFFFF), 2);
        assert_eq!(compaction_width(0x1_0000), 3);
        assert_eq!(compaction_width(0xFF_FFFF), 3);
        assert_eq!(compaction_width(0x100_0000), 4);
        assert_eq!(compaction_width(u32::MAX), 4);
    }

    #[test]
    fn big_endian_packing() {
        let (bytes, width) = encode_elements(&[0x0102, 0x0304]);
        assert_eq!(width, 2);
        assert_eq!(bytes, vec![0x01, 0x02, 0x03, 0x04]);

        let (bytes, width) = encode_elements(&[0x01_0203]);
        assert_eq!(width, 3);
        assert_eq!(bytes, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn packed_count_layout() {
        let packed = pack_count(300, 2).unwrap();
        assert_eq!(packed, 300 | 2 << 24);
        assert_eq!(unpack_count(packed), (300, 2));
        assert!(pack_count(MAX_BLOCK_ELEMENTS + 1, 1).is_err());
    }

    #[test]
    fn short_data_is_corruption() {
        assert!(decode_elements(&[1, 2, 3], 2, 2).is_err());
        assert!(decode_elements(&[1], 1, 5).is_err());
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(mut elements in proptest::collection::vec(any::<u32>(), 0..200)) {
            elements.sort_unstable();
            let (bytes, width) = encode_elements(&elements);
            prop_assert_eq!(bytes.len(), elements.len() * width as usize);
            let decoded = decode_elements(&bytes, elements.len(), width).unwrap();
            prop_assert_eq!(decoded, elements);
        }
    }
}
