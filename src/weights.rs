//! Weight archives: zip files of `.npy` arrays named `arr_0.npy`, `arr_1.npy`, ...
//!
//! This is the layout numpy's `savez` / `savez_compressed` produce when
//! given positional arrays. Only little-endian float arrays in C order are
//! supported; `<f8` data is narrowed to `f32` on read.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::ModelError;

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

/// A dense `f32` array with its shape, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl NpyArray {
    /// Creates an array; `data.len()` must equal the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ModelError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ModelError::Archive(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Reads every `arr_i.npy` entry of the archive, in index order.
pub fn read_archive(path: impl AsRef<Path>) -> Result<Vec<NpyArray>, ModelError> {
    let path = path.as_ref();
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;

    let total = archive.len();
    let mut arrays = Vec::with_capacity(total);
    for index in 0..total {
        let name = entry_name(index);
        let mut entry = match archive.by_name(&name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ModelError::Archive(format!(
                    "{} has {total} entries but no {name}",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        let array = parse_npy(&bytes).map_err(|err| match err {
            ModelError::Archive(message) => ModelError::Archive(format!("{name}: {message}")),
            other => other,
        })?;
        arrays.push(array);
    }

    info!("Read {} arrays from {}", arrays.len(), path.display());
    Ok(arrays)
}

/// Writes `arrays` as a deflate-compressed archive loadable by [`read_archive`] and numpy.
pub fn write_archive(path: impl AsRef<Path>, arrays: &[NpyArray]) -> Result<(), ModelError> {
    let path = path.as_ref();
    let mut writer = ZipWriter::new(BufWriter::new(File::create(path)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (index, array) in arrays.iter().enumerate() {
        writer.start_file(entry_name(index), options)?;
        writer.write_all(&encode_npy(array))?;
    }
    writer.finish()?.flush()?;

    info!("Wrote {} arrays to {}", arrays.len(), path.display());
    Ok(())
}

fn entry_name(index: usize) -> String {
    format!("arr_{index}.npy")
}

/// Parses one `.npy` file (format versions 1 to 3).
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray, ModelError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(ModelError::Archive("not an npy file".to_string()));
    }

    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            let raw = bytes
                .get(8..12)
                .ok_or_else(|| ModelError::Archive("truncated header".to_string()))?;
            (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, 12)
        }
        _ => {
            return Err(ModelError::Archive(format!(
                "unsupported npy version {major}"
            )));
        }
    };

    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or_else(|| ModelError::Archive("truncated header".to_string()))?;
    let header = std::str::from_utf8(header)
        .map_err(|_| ModelError::Archive("header is not valid text".to_string()))?;

    let descr = header_value(header, "descr")?
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    if header_value(header, "fortran_order")? != "False" {
        return Err(ModelError::Archive(
            "Fortran-ordered arrays are not supported".to_string(),
        ));
    }
    let shape = parse_shape(header_value(header, "shape")?)?;

    let count: usize = shape.iter().product();
    let payload = &bytes[data_start..];
    let data = match descr.as_str() {
        "<f4" => read_values::<4>(payload, count, |raw| f32::from_le_bytes(raw))?,
        "<f8" => read_values::<8>(payload, count, |raw| f64::from_le_bytes(raw) as f32)?,
        other => {
            return Err(ModelError::Archive(format!(
                "unsupported dtype '{other}', expected '<f4' or '<f8'"
            )));
        }
    };

    NpyArray::new(shape, data)
}

/// Encodes an array as a version 1.0 `.npy` file with `<f4` data.
pub fn encode_npy(array: &NpyArray) -> Vec<u8> {
    let shape = match array.shape.as_slice() {
        [single] => format!("({single},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {shape}, }}");
    // magic + version + length field + header + '\n' is padded to the alignment
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut bytes = Vec::with_capacity(MAGIC.len() + 4 + header.len() + array.data.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    for value in &array.data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Returns the raw text of `key`'s value in the header dictionary.
fn header_value<'a>(header: &'a str, key: &str) -> Result<&'a str, ModelError> {
    let missing = || ModelError::Archive(format!("header has no '{key}' field"));
    let start = header
        .find(&format!("'{key}'"))
        .ok_or_else(missing)?
        + key.len()
        + 2;
    let rest = header[start..].trim_start();
    let rest = rest.strip_prefix(':').ok_or_else(missing)?.trim_start();

    let end = match rest.starts_with('(') {
        true => rest.find(')').map(|i| i + 1),
        false => rest.find([',', '}']),
    };
    let end = end.ok_or_else(missing)?;
    Ok(rest[..end].trim())
}

fn parse_shape(text: &str) -> Result<Vec<usize>, ModelError> {
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| ModelError::Archive(format!("malformed shape {text}")))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| ModelError::Archive(format!("malformed shape {text}")))
        })
        .collect()
}

fn read_values<const N: usize>(
    payload: &[u8],
    count: usize,
    convert: impl Fn([u8; N]) -> f32,
) -> Result<Vec<f32>, ModelError> {
    if payload.len() < count * N {
        return Err(ModelError::Archive(format!(
            "expected {} data bytes, found {}",
            count * N,
            payload.len()
        )));
    }
    Ok(payload[..count * N]
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            convert(raw)
        })
        .collect())
}
