//! Line codec for the history log: one JSON object per `\n`-terminated line.

use serde_json::Value;

use crate::error::DecodeError;
use crate::record::Record;

/// Decode one log line (without its trailing newline) into a [`Record`].
///
/// The line must be a JSON object.  When present, `id` must be a string;
/// `null` is treated the same as a missing id.
pub fn decode_line(line: &str) -> Result<Record, DecodeError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Value::Object(fields) = serde_json::from_str::<Value>(line)? else {
        return Err(DecodeError::NotAnObject);
    };

    let id = match fields.get("id") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(id)) => id.clone(),
        Some(_) => return Err(DecodeError::InvalidId),
    };

    Ok(Record::from_parts(id, fields))
}

/// Encode a record as a single line, without the trailing newline.
/// `serde_json` escapes embedded newlines, so the result is always one line.
pub fn encode_line(record: &Record) -> Result<String, serde_json::Error> {
    serde_json::to_string(record.payload())
}
