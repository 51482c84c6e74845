use crate::store::FileStoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

const ZSTD_LEVEL: i32 = 3;

/// CBOR-encode then zstd-compress.
pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FileStoreError> {
    let mut cbor = Vec::new();
    ciborium::into_writer(value, &mut cbor).map_err(|e| FileStoreError::CborEncode(e.to_string()))?;
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    encoder.write_all(&cbor)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, FileStoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut cbor = Vec::new();
    decoder.read_to_end(&mut cbor)?;
    ciborium::from_reader(cbor.as_slice()).map_err(|e| FileStoreError::CborDecode(e.to_string()))
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
