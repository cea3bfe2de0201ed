//! Row record encoding.
//!
//! ```text
//! | reserved (4) | { cell type (4) | offset (4) } * columns | payloads... |
//! ```
//!
//! Offsets are from the start of the record; a cell's payload ends where
//! the next cell's begins, or at the end of the record. Cell type 1 is an
//! inline CBOR value. Cell type 2 is a large-object reference:
//!
//! ```text
//! | subtype (4) | reserved (4) | blob id (8) |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::value::{BlobRef, Value};
use bytes::{Buf, BufMut};

/// Inline serialized value.
pub const CELL_INLINE: i32 = 1;

/// Large-object reference.
pub const CELL_BLOB: i32 = 2;

const BLOB_CELL_SIZE: usize = 16;

fn header_size(columns: usize) -> usize {
    4 + columns * 8
}

/// Serializes a row.
///
/// # Errors
///
/// Returns a codec error if a value cannot be encoded.
pub fn encode_row(values: &[Value]) -> CoreResult<Vec<u8>> {
    let mut payloads: Vec<(i32, Vec<u8>)> = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Blob(blob) => {
                let mut cell = Vec::with_capacity(BLOB_CELL_SIZE);
                cell.put_i32(blob.subtype);
                cell.put_i32(0);
                cell.put_i64(blob.id as i64);
                payloads.push((CELL_BLOB, cell));
            }
            other => {
                let mut cell = Vec::new();
                ciborium::into_writer(other, &mut cell)
                    .map_err(|e| CoreError::codec(e.to_string()))?;
                payloads.push((CELL_INLINE, cell));
            }
        }
    }

    let header = header_size(values.len());
    let total = header + payloads.iter().map(|(_, p)| p.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(total);
    buf.put_i32(0);
    let mut offset = header;
    for (ty, payload) in &payloads {
        buf.put_i32(*ty);
        buf.put_i32(offset as i32);
        offset += payload.len();
    }
    for (_, payload) in payloads {
        buf.put_slice(&payload);
    }
    Ok(buf)
}

/// Reads `(cell type, start, end)` of `column`.
fn cell_bounds(data: &[u8], columns: usize, column: usize) -> CoreResult<(i32, usize, usize)> {
    if column >= columns {
        return Err(CoreError::invalid_operation(format!(
            "column {column} out of range ({columns} columns)"
        )));
    }
    if data.len() < header_size(columns) {
        return Err(CoreError::corruption("row record shorter than its header"));
    }
    let mut entry = &data[4 + column * 8..];
    let ty = entry.get_i32();
    let start = entry.get_i32();
    let end = if column + 1 < columns {
        let _next_ty = entry.get_i32();
        entry.get_i32()
    } else {
        data.len() as i32
    };
    if start < header_size(columns) as i32 || end < start || end as usize > data.len() {
        return Err(CoreError::corruption(format!(
            "cell {column} spans {start}..{end} in a {} byte record",
            data.len()
        )));
    }
    Ok((ty, start as usize, end as usize))
}

/// Decodes one cell of a record.
///
/// # Errors
///
/// Returns `Corruption` if the record is malformed.
pub fn decode_cell(data: &[u8], columns: usize, column: usize) -> CoreResult<Value> {
    let (ty, start, end) = cell_bounds(data, columns, column)?;
    let mut payload = &data[start..end];
    match ty {
        CELL_INLINE => {
            ciborium::from_reader(payload).map_err(|e| CoreError::codec(e.to_string()))
        }
        CELL_BLOB => {
            if payload.len() < BLOB_CELL_SIZE {
                return Err(CoreError::corruption("truncated blob cell"));
            }
            let subtype = payload.get_i32();
            let _reserved = payload.get_i32();
            let id = payload.get_i64();
            Ok(Value::Blob(BlobRef::with_subtype(id as u64, subtype)))
        }
        other => Err(CoreError::corruption(format!("unknown cell type {other}"))),
    }
}

/// Decodes every cell of a record.
///
/// # Errors
///
/// Returns `Corruption` if the record is malformed.
pub fn decode_row(data: &[u8], columns: usize) -> CoreResult<Vec<Value>> {
    (0..columns).map(|c| decode_cell(data, columns, c)).collect()
}

/// Large-object references held by a record.
///
/// # Errors
///
/// Returns `Corruption` if the record is malformed.
pub fn blob_refs(data: &[u8], columns: usize) -> CoreResult<Vec<BlobRef>> {
    let mut refs = Vec::new();
    for column in 0..columns {
        let (ty, _, _) = cell_bounds(data, columns, column)?;
        if ty == CELL_BLOB {
            if let Value::Blob(blob) = decode_cell(data, columns, column)? {
                refs.push(blob);
            }
        }
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Value> {
        vec![
            Value::Integer(42),
            Value::Null,
            Value::Text("hello".into()),
            Value::Blob(BlobRef::with_subtype(7, 3)),
            Value::Binary(vec![1, 2, 3]),
        ]
    }

    #[test]
    fn header_layout() {
        let data = encode_row(&sample()).unwrap();
        let mut buf = &data[..];
        assert_eq!(buf.get_i32(), 0);
        assert_eq!(buf.get_i32(), CELL_INLINE);
        assert_eq!(buf.get_i32(), header_size(5) as i32);
        let mut blob_entry = &data[4 + 3 * 8..];
        assert_eq!(blob_entry.get_i32(), CELL_BLOB);
    }

    #[test]
    fn blob_cell_layout() {
        let data = encode_row(&[Value::Blob(BlobRef::with_subtype(0x0102, 5))]).unwrap();
        let payload = &data[header_size(1)..];
        assert_eq!(payload, &[0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn cells_decode_individually() {
        let values = sample();
        let data = encode_row(&values).unwrap();
        for (i, v) in values.iter().enumerate() {
            assert_eq!(&decode_cell(&data, values.len(), i).unwrap(), v);
        }
        assert_eq!(decode_row(&data, values.len()).unwrap(), values);
    }

    #[test]
    fn blob_refs_found() {
        let data = encode_row(&sample()).unwrap();
        assert_eq!(blob_refs(&data, 5).unwrap(), vec![BlobRef::with_subtype(7, 3)]);
    }

    #[test]
    fn malformed_records_rejected() {
        assert!(decode_cell(&[0, 0], 1, 0).is_err());
        let data = encode_row(&[Value::Integer(1)]).unwrap();
        assert!(decode_cell(&data, 1, 1).is_err());

        let mut bad = data.clone();
        bad[11] = 0xFF; // offset beyond the record
        assert!(decode_cell(&bad, 1, 0).is_err());
    }
}
