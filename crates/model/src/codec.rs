//! Demo wire format for raw entries.
//!
//! The processor's invariants only need keys that identify a table and a row
//! handle, and values the mounter can decode against a schema snapshot.
//! Row keys are `t{table_id:be64}_r{handle:be64}`; row values are a JSON
//! object of column name to value; DDL values are a JSON [`DdlJob`].

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ddl::DdlJob;
use crate::TableId;

/// Prefix of all row keys.
pub const ROW_KEY_PREFIX: u8 = b't';

/// Prefix of the DDL (meta) key-range.
pub const DDL_KEY_PREFIX: u8 = b'm';

const RECORD_SEP: &[u8] = b"_r";
const ROW_KEY_LEN: usize = 1 + 8 + 2 + 8;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed key: {0}")]
    Key(String),

    #[error("malformed value: {0}")]
    Value(#[from] serde_json::Error),
}

/// Encode a row key: `t{table_id:be64}_r{handle:be64}`.
pub fn encode_row_key(table_id: TableId, handle: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(ROW_KEY_LEN);
    buf.put_u8(ROW_KEY_PREFIX);
    buf.put_i64(table_id);
    buf.put_slice(RECORD_SEP);
    buf.put_i64(handle);
    buf.freeze()
}

/// Decode a row key into `(table_id, handle)`.
pub fn decode_row_key(key: &[u8]) -> Result<(TableId, i64), CodecError> {
    if key.len() != ROW_KEY_LEN || key[0] != ROW_KEY_PREFIX || &key[9..11] != RECORD_SEP {
        return Err(CodecError::Key(format!("not a row key ({} bytes)", key.len())));
    }
    let table_id = i64::from_be_bytes(key[1..9].try_into().unwrap());
    let handle = i64::from_be_bytes(key[11..19].try_into().unwrap());
    Ok((table_id, handle))
}

/// Extract the table id from a row key without validating the handle part.
pub fn table_id_from_key(key: &[u8]) -> Option<TableId> {
    if key.len() >= 9 && key[0] == ROW_KEY_PREFIX {
        Some(i64::from_be_bytes(key[1..9].try_into().unwrap()))
    } else {
        None
    }
}

/// Encode row column values as a JSON object.
pub fn encode_row_value(columns: &Map<String, Value>) -> Bytes {
    // Serializing a json Map cannot fail.
    Bytes::from(serde_json::to_vec(columns).expect("json map serialization"))
}

/// Decode a row value back into its column map.
pub fn decode_row_value(value: &[u8]) -> Result<Map<String, Value>, CodecError> {
    Ok(serde_json::from_slice(value)?)
}

/// Encode a DDL job for the meta key-range.
pub fn encode_ddl_value(job: &DdlJob) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(job)?))
}

/// Decode a DDL job from a meta-range value.
pub fn decode_ddl_job(value: &[u8]) -> Result<DdlJob, CodecError> {
    Ok(serde_json::from_slice(value)?)
}
