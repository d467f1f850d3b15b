//! Decoding of annotation payloads received over the data channel

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// One detected object in source pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub object_id: Option<i64>,
    /// `[x1, y1, x2, y2]`
    pub bbox: [i32; 4],
    pub class_name: String,
    pub confidence: f32,
}

/// Decode a `{"detections": [...]}` batch.
///
/// Only an unreadable envelope is an error. Entries that are not objects or
/// carry an unusable `bbox` are skipped one by one with a warning.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Detection>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Payload(format!("not UTF-8: {}", e)))?;
    let envelope: Value = serde_json::from_str(text)?;

    let entries = match envelope.get("detections") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(Error::Payload(format!(
                "`detections` is not a list: {}",
                other
            )))
        }
    };

    let mut detections = Vec::with_capacity(entries.len());
    for entry in entries {
        match decode_entry(entry) {
            Ok(detection) => detections.push(detection),
            Err(reason) => {
                metrics::counter!("overlay_entries_skipped_total").increment(1);
                warn!("Skipping detection {}: {}", entry, reason);
            }
        }
    }
    Ok(detections)
}

fn decode_entry(entry: &Value) -> std::result::Result<Detection, &'static str> {
    let entry = entry.as_object().ok_or("entry is not an object")?;

    let bbox = match entry.get("bbox") {
        Some(Value::Array(coords)) if coords.len() == 4 => coords,
        _ => return Err("bbox must be a list of 4 numbers"),
    };
    let mut rect = [0i32; 4];
    for (slot, coord) in rect.iter_mut().zip(bbox) {
        *slot = pixel_coordinate(coord)?;
    }

    Ok(Detection {
        object_id: entry.get("object_id").and_then(Value::as_i64),
        bbox: rect,
        class_name: entry
            .get("class_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        confidence: entry
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32,
    })
}

fn pixel_coordinate(coord: &Value) -> std::result::Result<i32, &'static str> {
    if let Some(v) = coord.as_i64() {
        return i32::try_from(v).map_err(|_| "bbox coordinate out of range");
    }
    let v = coord.as_f64().ok_or("bbox coordinate is not a number")?;
    if v.is_finite() && v >= i32::MIN as f64 && v <= i32::MAX as f64 {
        Ok(v as i32)
    } else {
        Err("bbox coordinate out of range")
    }
}
