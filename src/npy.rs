/*
Reading and writing the `.npy` binary array format.

Artifacts are always written as version 1.0, little-endian `f8`, C order,
uncompressed. Reading also accepts `f4`, `i4` and `i8` element types and
version 2.0 headers, all converted to `f64`.
*/

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

/// A dense row-major array of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Array {
    pub fn from_vec(data: Vec<f64>) -> Self {
        Array {
            shape: vec![data.len()],
            data,
        }
    }

    /// Builds a 2-D array from equally long rows.
    pub fn from_rows(rows: &[Vec<f64>], cols: usize) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == cols));
        Array {
            shape: vec![rows.len(), cols],
            data: rows.iter().flatten().copied().collect(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Rows of a 2-D array.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        let cols = self.shape.get(1).copied().unwrap_or(0).max(1);
        self.data.chunks(cols)
    }

    fn header(&self) -> String {
        let shape = match self.shape.as_slice() {
            [n] => format!("({},)", n),
            dims => format!(
                "({})",
                dims.iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut header = format!(
            "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
            shape
        );
        // Magic (6) + version (2) + length (2) + header + newline is padded
        // to a multiple of 64 bytes.
        let unpadded = MAGIC.len() + 4 + header.len() + 1;
        let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
        header.extend(std::iter::repeat(' ').take(padding));
        header.push('\n');
        header
    }

    pub fn write_to(&self, mut w: impl Write) -> std::io::Result<()> {
        let header = self.header();
        w.write_all(MAGIC)?;
        w.write_all(&[1, 0])?;
        w.write_u16::<LittleEndian>(header.len() as u16)?;
        w.write_all(header.as_bytes())?;
        for &x in &self.data {
            w.write_f64::<LittleEndian>(x)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.data.len() * 8);
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut buf);
        buf
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::read_from(&mut bytes.as_slice()).map_err(|reason| Error::format(path, reason))
    }

    fn read_from(r: &mut impl Read) -> std::result::Result<Self, String> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic).map_err(|e| e.to_string())?;
        if &magic != MAGIC {
            return Err("not an npy file".into());
        }

        let major = r.read_u8().map_err(|e| e.to_string())?;
        let _minor = r.read_u8().map_err(|e| e.to_string())?;
        let header_len = match major {
            1 => r.read_u16::<LittleEndian>().map(|n| n as usize),
            2 | 3 => r.read_u32::<LittleEndian>().map(|n| n as usize),
            v => return Err(format!("unsupported npy version {}", v)),
        }
        .map_err(|e| e.to_string())?;

        let mut header = vec![0u8; header_len];
        r.read_exact(&mut header).map_err(|e| e.to_string())?;
        let header = String::from_utf8_lossy(&header);

        let descr = header_value(&header, "descr")
            .map(|v| v.trim_matches(|c| c == '\'' || c == '"').to_string())
            .ok_or("header has no descr")?;
        if header_value(&header, "fortran_order").as_deref() == Some("True") {
            return Err("fortran-ordered arrays are not supported".into());
        }
        let shape = header_value(&header, "shape")
            .ok_or("header has no shape")
            .and_then(|s| parse_shape(&s).ok_or("malformed shape"))?;

        let count = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or("shape is too large")?;
        let data = (0..count)
            .map(|_| match descr.as_str() {
                "<f8" => r.read_f64::<LittleEndian>(),
                "<f4" => r.read_f32::<LittleEndian>().map(|x| x as f64),
                "<i8" => r.read_i64::<LittleEndian>().map(|x| x as f64),
                "<i4" => r.read_i32::<LittleEndian>().map(|x| x as f64),
                _ => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unsupported dtype {}", descr),
                )),
            })
            .collect::<std::io::Result<Vec<f64>>>()
            .map_err(|e| e.to_string())?;

        Ok(Array { shape, data })
    }
}

/// Extracts the raw text of `key`'s value from a Python dict literal.
fn header_value(header: &str, key: &str) -> Option<String> {
    let start = header.find(&format!("'{}'", key))? + key.len() + 2;
    let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find(',').or_else(|| rest.find('}'))?
    };
    Some(rest[..end].trim().to_string())
}

fn parse_shape(text: &str) -> Option<Vec<usize>> {
    text.trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_aligned_and_terminated() {
        let bytes = Array::from_vec(vec![1.0, 2.0, 3.0]).to_bytes();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(bytes.len(), 10 + header_len + 24);
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.starts_with("{'descr': '<f8', 'fortran_order': False, 'shape': (3,), }"));
    }

    #[test]
    fn reads_back_matrix() {
        let rows = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let array = Array::from_rows(&rows, 3);
        let parsed = Array::read_from(&mut array.to_bytes().as_slice()).unwrap();
        assert_eq!(parsed.shape(), &[2, 3]);
        assert_eq!(parsed.rows().nth(1).unwrap(), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn reads_int64_arrays_written_elsewhere() {
        let header = "{'descr': '<i8', 'fortran_order': False, 'shape': (2,), }";
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[1u8, 0]);
        bytes.extend((header.len() as u16).to_le_bytes());
        bytes.extend(header.as_bytes());
        bytes.extend(7i64.to_le_bytes());
        bytes.extend((-3i64).to_le_bytes());

        let parsed = Array::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed.data(), &[7.0, -3.0]);
    }

    #[test]
    fn rejects_overflowing_shape() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (18446744073709551615, 3), }";
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[1u8, 0]);
        bytes.extend((header.len() as u16).to_le_bytes());
        bytes.extend(header.as_bytes());

        let err = Array::read_from(&mut bytes.as_slice()).unwrap_err();
        assert!(err.contains("too large"), "{}", err);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Array::read_from(&mut b"RIFF....".as_slice()).is_err());
    }

    #[test]
    fn empty_shape_entries() {
        assert_eq!(parse_shape("(12, 40)"), Some(vec![12, 40]));
        assert_eq!(parse_shape("(0,)"), Some(vec![0]));
    }
}
