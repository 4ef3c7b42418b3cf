//! Reading traces from disk.
//!
//! Two layouts are accepted, optionally compressed (`.gz` as written by the
//! XLA profiler, or `.zst`):
//!
//! - native: `{"submitted_at": 0.0, "events": [TraceEvent, ...]}`
//! - Chrome trace (XLA profiler export): `{"traceEvents": [...]}` or a bare
//!   array. Only complete (`"ph": "X"`) events are kept; times are in
//!   microseconds.

use std::{io::Read, path::Path};

use flate2::read::GzDecoder;
use serde_json::Value;

use crate::event::{Category, Trace, TraceError, TraceEvent};

/// Collective op labels, most specific first so `collective-permute-start`
/// wins over `collective-permute`.
const COLLECTIVE_KEYS: &[&str] = &[
    "collective-permute-start",
    "collective-permute-done",
    "collective-permute",
    "reduce-scatter",
    "all-reduce",
    "all-gather",
    "all_gather",
    "all-to-all",
    "send",
    "recv",
];

/// Sidecar and report files that live next to traces but are not traces.
const NON_TRACE_FILES: &[&str] = &["metadata.json", "transfer.json", "summary.json"];

/// Whether a file name looks like a trace artifact.
#[must_use]
pub fn is_trace_file(name: &str) -> bool {
    if NON_TRACE_FILES.contains(&name) {
        return false;
    }
    name.ends_with(".json") || name.ends_with(".json.gz") || name.ends_with(".json.zst")
}

/// Load a trace file, decompressing `.gz` and `.zst` files first.
pub fn load_trace(path: impl AsRef<Path>) -> Result<Trace, TraceError> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|e| TraceError::Io(path.to_path_buf(), e))?;
    let bytes = match path.extension().and_then(|ext| ext.to_str()) {
        Some("zst") => zstd::stream::decode_all(raw.as_slice())
            .map_err(|e| TraceError::Decompress(path.to_path_buf(), e))?,
        Some("gz") => {
            let mut out = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| TraceError::Decompress(path.to_path_buf(), e))?;
            out
        }
        _ => raw,
    };
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| TraceError::Parse(path.to_path_buf(), e.to_string()))?;
    let trace = parse_trace(value).map_err(|e| match e {
        TraceError::UnknownFormat(_) => TraceError::UnknownFormat(path.to_path_buf()),
        other => other,
    })?;
    tracing::debug!("Loaded {} events from {}", trace.len(), path.display());
    Ok(trace)
}

/// Build a trace from an already-parsed JSON document.
pub fn parse_trace(value: Value) -> Result<Trace, TraceError> {
    match value {
        Value::Object(mut map) => {
            if let Some(events) = map.remove("traceEvents") {
                return chrome_events(&events);
            }
            if map.contains_key("events") {
                let native: Trace = serde_json::from_value(Value::Object(map))
                    .map_err(|e| TraceError::Invalid(e.to_string()))?;
                return Trace::new(native.submitted_at, native.events);
            }
            Err(TraceError::UnknownFormat(std::path::PathBuf::new()))
        }
        array @ Value::Array(_) => chrome_events(&array),
        _ => Err(TraceError::UnknownFormat(std::path::PathBuf::new())),
    }
}

fn chrome_events(events: &Value) -> Result<Trace, TraceError> {
    let Some(events) = events.as_array() else {
        return Err(TraceError::Invalid("traceEvents is not an array".into()));
    };
    let mapped = events.iter().filter_map(chrome_event).collect();
    Trace::new(None, mapped)
}

/// Map one Chrome trace record; `None` for anything that is not a complete
/// event with a usable timestamp and duration.
fn chrome_event(event: &Value) -> Option<TraceEvent> {
    if event.get("ph").and_then(Value::as_str) != Some("X") {
        return None;
    }
    let name = event.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = event.get("args");
    let start = number(event.get("ts")?)?;
    let duration = match args.and_then(|a| a.get("device_duration_ps")).and_then(number) {
        Some(ps) => ps / 1e6,
        None => number(event.get("dur")?)?,
    };
    let device_id = event.get("pid").and_then(Value::as_u64).unwrap_or(0);

    let hlo_category = args
        .and_then(|a| a.get("hlo_category"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    let lowered = name.to_lowercase();

    let (category, op_name) = if let Some(key) = collective_label(hlo_category.as_deref(), &lowered)
    {
        (Category::Communication, key.to_string())
    } else if lowered.contains("idle") {
        (Category::Idle, name.to_string())
    } else {
        (Category::Compute, name.to_string())
    };

    let bytes_transferred = args.and_then(|a| {
        a.get("bytes_transferred")
            .or_else(|| a.get("raw_bytes_accessed"))
            .and_then(number)
            .filter(|b| *b >= 0.0)
            .map(|b| b as u64)
    });

    Some(TraceEvent {
        start,
        duration,
        device_id,
        category,
        op_name,
        bytes_transferred,
        output: false,
    })
}

fn collective_label(hlo_category: Option<&str>, name: &str) -> Option<&'static str> {
    if let Some(category) = hlo_category
        && let Some(key) = COLLECTIVE_KEYS.iter().find(|k| **k == category)
    {
        return Some(key);
    }
    COLLECTIVE_KEYS.iter().copied().find(|k| name.contains(k))
}

/// Profilers emit numbers both as JSON numbers and as numeric strings.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
