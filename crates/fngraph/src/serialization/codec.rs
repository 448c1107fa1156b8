//! Byte and text encodings of [`GraphDictionary`].
//!
//! The binary form is an 8-byte magic, the dictionary version as a little-endian u32,
//! then the bincode payload of that version's layout. The JSON form carries the version
//! as a top-level field.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::composite::CompositeFunction;
use crate::device::DeviceDescriptor;
use crate::error::{ensure, Error, Result};

use super::dictionary::{GraphDictionary, SUPPORTED_VERSIONS};
use super::legacy::GraphDictionaryV1;

const MAGIC: &[u8; 8] = b"FNGRAPH1";
const HEADER_LEN: usize = MAGIC.len() + 4;

pub fn to_bytes(dictionary: &GraphDictionary) -> Result<Vec<u8>> {
    let payload = bincode::serialize(dictionary)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&dictionary.version.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn from_bytes(bytes: &[u8]) -> Result<GraphDictionary> {
    ensure!(
        bytes.len() >= HEADER_LEN && &bytes[..MAGIC.len()] == MAGIC,
        format,
        "missing graph dictionary header"
    );
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[MAGIC.len()..HEADER_LEN]);
    let version = u32::from_le_bytes(version);
    let payload = &bytes[HEADER_LEN..];
    let dictionary = match version {
        1 => GraphDictionary::from(bincode::deserialize::<GraphDictionaryV1>(payload)?),
        2 => bincode::deserialize::<GraphDictionary>(payload)?,
        found => {
            return Err(Error::VersionMismatch {
                found,
                supported: SUPPORTED_VERSIONS,
            })
        }
    };
    Ok(dictionary)
}

pub fn to_json(dictionary: &GraphDictionary) -> Result<String> {
    Ok(serde_json::to_string_pretty(dictionary)?)
}

pub fn from_json(text: &str) -> Result<GraphDictionary> {
    let value: Value = serde_json::from_str(text)?;
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::format("graph dictionary has no version field"))?;
    let dictionary = match version {
        1 => GraphDictionary::from(serde_json::from_value::<GraphDictionaryV1>(value)?),
        2 => serde_json::from_value::<GraphDictionary>(value)?,
        found => {
            return Err(Error::VersionMismatch {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: SUPPORTED_VERSIONS,
            })
        }
    };
    Ok(dictionary)
}

impl CompositeFunction {
    /// Writes the binary encoding of [`CompositeFunction::serialize`] to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = to_bytes(&self.serialize()?)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, device: DeviceDescriptor) -> Result<Arc<CompositeFunction>> {
        let bytes = fs::read(path)?;
        CompositeFunction::deserialize(&from_bytes(&bytes)?, device)
    }
}
