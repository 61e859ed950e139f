//! Minimal reader and writer for 2-D float `.npy` files.
//!
//! Supports format versions 1.0, 2.0 and 3.0 with little-endian `<f4` or
//! `<f8` data in C order. Reads go through a read-only memory map.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use ndarray::Array2;

use crate::error::GalleryError;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element type of the stored array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    F32,
    F64,
}

impl NpyDtype {
    fn size(&self) -> usize {
        match self {
            NpyDtype::F32 => 4,
            NpyDtype::F64 => 8,
        }
    }
}

/// Parsed `.npy` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: NpyDtype,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the first data element.
    pub data_offset: usize,
}

/// Parse the magic string, version and header dictionary.
pub fn parse_header(bytes: &[u8]) -> Result<NpyHeader, GalleryError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(GalleryError::Npy("missing NUMPY magic".to_string()));
    }

    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(GalleryError::Npy("truncated header".to_string()));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => return Err(GalleryError::Npy(format!("unsupported format version {v}"))),
    };

    let data_offset = header_start + header_len;
    let dict = bytes
        .get(header_start..data_offset)
        .ok_or_else(|| GalleryError::Npy("truncated header".to_string()))?;
    let dict = std::str::from_utf8(dict)
        .map_err(|e| GalleryError::Npy(format!("header is not text: {e}")))?;

    let descr = dict_value(dict, "descr")
        .ok_or_else(|| GalleryError::Npy("header has no descr".to_string()))?;
    let dtype = match descr.trim_matches(|c| c == '\'' || c == '"') {
        "<f4" => NpyDtype::F32,
        "<f8" => NpyDtype::F64,
        other => return Err(GalleryError::Npy(format!("unsupported dtype {other}"))),
    };

    let fortran_order = match dict_value(dict, "fortran_order") {
        Some("False") => false,
        Some("True") => true,
        _ => return Err(GalleryError::Npy("header has no fortran_order".to_string())),
    };

    let shape_text = dict_value(dict, "shape")
        .ok_or_else(|| GalleryError::Npy("header has no shape".to_string()))?;
    let shape = shape_text
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| GalleryError::Npy(format!("bad shape entry {s:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NpyHeader {
        dtype,
        fortran_order,
        shape,
        data_offset,
    })
}

/// Raw text of a value in the header dict, e.g. `'<f4'`, `False`, `(3, 2)`.
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let quoted = format!("'{key}'");
    let start = dict.find(&quoted)? + quoted.len();
    let rest = dict[start..].trim_start().strip_prefix(':')?.trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find([',', '}'])?
    };
    Some(rest[..end].trim())
}

/// Read a 2-D float matrix as f32.
///
/// # Errors
/// Fails on a malformed header, an unsupported dtype, Fortran order, a shape
/// that is not two positive dimensions, or a short data section.
pub fn read_matrix(path: &Path) -> Result<Array2<f32>, GalleryError> {
    let file = File::open(path)?;
    // SAFETY: read-only mapping; the data is copied out before returning.
    let mmap = unsafe { Mmap::map(&file) }?;

    let header = parse_header(&mmap)?;
    if header.fortran_order {
        return Err(GalleryError::Npy("Fortran-order arrays are not supported".to_string()));
    }
    let (rows, cols) = match header.shape.as_slice() {
        [r, c] if *r > 0 && *c > 0 => (*r, *c),
        _ => return Err(GalleryError::Shape(header.shape.clone())),
    };

    let byte_len = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(header.dtype.size()))
        .ok_or_else(|| GalleryError::Npy(format!("shape ({rows}, {cols}) is too large")))?;
    let end = header
        .data_offset
        .checked_add(byte_len)
        .ok_or_else(|| GalleryError::Npy(format!("data section of {byte_len} bytes is too large")))?;
    let data = mmap
        .get(header.data_offset..end)
        .ok_or_else(|| {
            GalleryError::Npy(format!(
                "expected {} data bytes, file has {}",
                byte_len,
                mmap.len().saturating_sub(header.data_offset)
            ))
        })?;

    let values: Vec<f32> = match header.dtype {
        NpyDtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        NpyDtype::F64 => data
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect(),
    };

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| GalleryError::Npy(format!("matrix: {e}")))
}

/// Write a 2-D f32 matrix as a version 1.0 `.npy` file.
pub fn write_matrix(path: &Path, matrix: &Array2<f32>) -> Result<(), GalleryError> {
    let (rows, cols) = matrix.dim();
    let mut dict =
        format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
    // Pad so the data starts on a 64-byte boundary; the header ends in '\n'.
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    dict.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    dict.push('\n');

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = Vec::with_capacity(MAGIC.len() + 4 + dict.len() + rows * cols * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    for v in matrix.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }

    let mut file = File::create(path)?;
    file.write_all(&out)?;
    Ok(())
}
