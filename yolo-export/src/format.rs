//! Binary framing shared by checkpoints and exported artifacts:
//!
//! ```text
//! magic: [u8; 8] | version: u32 LE | header_len: u32 LE | header: JSON | blob
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Where a tensor lives inside the blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: DType,
    /// Dequantisation scale for `I8` tensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
    pub offset: usize,
}

impl TensorEntry {
    /// Element count, or `None` if the shape overflows `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.numel()?.checked_mul(self.dtype.size())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    I8,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I8 => 1,
        }
    }
}

/// A parsed container whose header and blob borrow from the input bytes.
pub struct Container<'a> {
    pub version: u32,
    pub header: &'a [u8],
    pub blob: &'a [u8],
}

/// Splits `bytes` into header and blob, checking the magic.
pub fn parse<'a>(bytes: &'a [u8], magic: &[u8; 8]) -> Result<Container<'a>, String> {
    if bytes.len() < 16 {
        return Err(format!("file is too short ({} bytes)", bytes.len()));
    }
    if &bytes[..8] != magic {
        return Err("unrecognised file signature".into());
    }
    let version = read_u32(&bytes[8..12]);
    let header_len = read_u32(&bytes[12..16]) as usize;
    let header_end = 16usize
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| format!("header length {header_len} exceeds file size"))?;
    Ok(Container {
        version,
        header: &bytes[16..header_end],
        blob: &bytes[header_end..],
    })
}

/// Writes a container in one pass. Returns the number of bytes written.
pub fn write(
    path: &Path,
    magic: &[u8; 8],
    version: u32,
    header: &[u8],
    blob: &[u8],
) -> std::io::Result<u64> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(magic)?;
    f.write_all(&version.to_le_bytes())?;
    f.write_all(&(header.len() as u32).to_le_bytes())?;
    f.write_all(header)?;
    f.write_all(blob)?;
    f.flush()?;
    Ok((16 + header.len() + blob.len()) as u64)
}

/// Returns the slice of `blob` that holds `entry`.
pub fn tensor_bytes<'a>(blob: &'a [u8], entry: &TensorEntry) -> Result<&'a [u8], String> {
    let len = entry.byte_len().ok_or_else(|| {
        format!("tensor '{}' has an oversized shape {:?}", entry.name, entry.shape)
    })?;
    entry
        .offset
        .checked_add(len)
        .filter(|&end| end <= blob.len())
        .map(|end| &blob[entry.offset..end])
        .ok_or_else(|| {
            format!(
                "tensor '{}' ({len} bytes at offset {}) runs past the end of the data",
                entry.name, entry.offset
            )
        })
}

pub fn append_f32(blob: &mut Vec<u8>, values: impl IntoIterator<Item = f32>) {
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_foreign_files() {
        assert!(parse(b"short", b"YOLOCKPT").is_err());
        assert!(parse(b"PK\x03\x04aaaaaaaaaaaaaaaaaaaa", b"YOLOCKPT").is_err());
    }

    #[test]
    fn parse_rejects_oversized_header() {
        let mut bytes = b"YOLOCKPT".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(b"{}");
        assert!(parse(&bytes, b"YOLOCKPT").is_err());
    }

    #[test]
    fn tensor_bytes_checks_bounds() {
        let entry = TensorEntry {
            name: "w".into(),
            shape: vec![2, 2],
            dtype: DType::F32,
            scale: None,
            offset: 4,
        };
        assert!(tensor_bytes(&[0u8; 20], &entry).is_ok());
        assert!(tensor_bytes(&[0u8; 19], &entry).is_err());
    }
    #[test]
    fn tensor_bytes_rejects_overflowing_shape() {
        let entry = TensorEntry {
            name: "w".into(),
            shape: vec![usize::MAX / 2, 3],
            dtype: DType::F32,
            scale: None,
            offset: 0,
        };
        assert_eq!(entry.numel(), None);
        let err = tensor_bytes(&[0u8; 64], &entry).unwrap_err();
        assert!(err.contains("oversized"), "{err}");

        // fits in usize as elements, but not as bytes
        let bytes = TensorEntry {
            shape: vec![usize::MAX / 2],
            ..entry
        };
        assert!(bytes.numel().is_some());
        assert_eq!(bytes.byte_len(), None);
        assert!(tensor_bytes(&[0u8; 64], &bytes).is_err());
    }
}
