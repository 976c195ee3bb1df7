//! Record source: the ordered, immutable sequence of test records.
//!
//! Records are read from JSON Lines files. Load order is significant, since
//! a record's position decides its deadline, so files are concatenated in
//! the order given and lines keep their file order.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, SimError};

/// One unit of test data delivered to every target.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    /// Opaque feature mapping, forwarded verbatim.
    pub payload: Map<String, Value>,
    pub truth_label: Option<u8>,
}

/// Load records from `paths`, lifting `label_field` (when present) into
/// [`Record::truth_label`].
pub fn load_records(paths: &[PathBuf], label_field: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();

    for path in paths {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SimError::config(format!("cannot read record file {}: {e}", path.display()))
        })?;
        let before = records.len();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = parse_line(line, label_field)
                .map_err(|msg| SimError::config(format!("{}:{}: {msg}", path.display(), lineno + 1)))?;
            if !seen.insert(record.id) {
                return Err(SimError::config(format!(
                    "{}:{}: duplicate record id {}",
                    path.display(),
                    lineno + 1,
                    record.id
                )));
            }
            records.push(record);
        }
        debug!(path = %path.display(), count = records.len() - before, "loaded record file");
    }

    info!(files = paths.len(), records = records.len(), "record source ready");
    Ok(records)
}

fn parse_line(line: &str, label_field: &str) -> std::result::Result<Record, String> {
    let mut payload: Map<String, Value> =
        serde_json::from_str(line).map_err(|e| format!("not a JSON object: {e}"))?;

    let id = payload
        .remove("id")
        .ok_or_else(|| "missing 'id'".to_string())
        .and_then(|v| as_integer(&v).ok_or_else(|| format!("'id' is not an integer: {v}")))?;

    let truth_label = match payload.remove(label_field) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(u8::from(b)),
        Some(v) => match as_integer(&v) {
            Some(0) => Some(0),
            Some(1) => Some(1),
            _ => return Err(format!("'{label_field}' must be 0 or 1, got {v}")),
        },
    };

    Ok(Record {
        id,
        payload,
        truth_label,
    })
}

/// Integers may arrive as `3` or `3.0` depending on the exporter that
/// produced the file. Labels may also be `true`/`false`; ids may not.
fn as_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}
