//! Inference request parsing and validation

use crate::error::InferenceError;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Default whole-detection score cutoff
pub const DEFAULT_THRESHOLD: f32 = 0.5;
/// Default per-pixel binarization cutoff
pub const DEFAULT_MASK_THRESHOLD: f32 = 0.5;

/// Region prompt in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Same box with x coordinates scaled by `sx` and y coordinates by `sy`
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Validated inference request
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    /// Base64 image, data-URL prefix already stripped
    pub image: String,
    pub boxes: Vec<BoundingBox>,
    /// Cutoff applied to whole detections
    pub threshold: f32,
    /// Cutoff applied to mask pixels
    pub mask_threshold: f32,
}

/// Request fields as they arrive, before any bounds checking
#[derive(Debug, Deserialize)]
struct RawRequest {
    image: String,
    boxes: Vec<Vec<f64>>,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    mask_threshold: Option<f64>,
}

impl InferenceRequest {
    /// Parse a JSON body in any accepted shape and validate it.
    ///
    /// Accepted shapes: a direct mapping, `{"inputs": {...}}`,
    /// `{"dataframe_records": [row]}`, `{"dataframe_split": {...}}`, or a
    /// single-element array. Tabular shapes must hold exactly one row.
    pub fn from_json(body: &[u8]) -> Result<Self, InferenceError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| InferenceError::payload(format!("body is not valid JSON: {}", e)))?;
        let row = normalize(value)?;
        let raw: RawRequest = serde_json::from_value(Value::Object(row))
            .map_err(|e| InferenceError::payload(e.to_string()))?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawRequest> for InferenceRequest {
    type Error = InferenceError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let threshold = check_unit_interval("threshold", raw.threshold, DEFAULT_THRESHOLD)?;
        let mask_threshold =
            check_unit_interval("mask_threshold", raw.mask_threshold, DEFAULT_MASK_THRESHOLD)?;

        let boxes = raw
            .boxes
            .iter()
            .enumerate()
            .map(|(i, b)| parse_box(i, b))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            image: strip_data_url(&raw.image).to_string(),
            boxes,
            threshold,
            mask_threshold,
        })
    }
}

fn check_unit_interval(
    name: &str,
    value: Option<f64>,
    default: f32,
) -> Result<f32, InferenceError> {
    match value {
        None => Ok(default),
        Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => Ok(v as f32),
        Some(v) => Err(InferenceError::validation(format!(
            "{} must be within [0, 1], got {}",
            name, v
        ))),
    }
}

fn parse_box(index: usize, coords: &[f64]) -> Result<BoundingBox, InferenceError> {
    let [x1, y1, x2, y2] = <[f64; 4]>::try_from(coords).map_err(|_| {
        InferenceError::validation(format!(
            "box {} must have 4 coordinates [x1, y1, x2, y2], got {}",
            index,
            coords.len()
        ))
    })?;

    // Checked after narrowing: values beyond f32 range become infinite
    let [x1, y1, x2, y2] = [x1 as f32, y1 as f32, x2 as f32, y2 as f32];
    if ![x1, y1, x2, y2].iter().all(|c| c.is_finite()) {
        return Err(InferenceError::validation(format!(
            "box {} has non-finite coordinates",
            index
        )));
    }
    if x2 < x1 || y2 < y1 {
        return Err(InferenceError::validation(format!(
            "box {} must satisfy x1 <= x2 and y1 <= y2",
            index
        )));
    }

    Ok(BoundingBox::new(x1, y1, x2, y2))
}

fn strip_data_url(image: &str) -> &str {
    let trimmed = image.trim();
    if trimmed.starts_with("data:") {
        if let Some(idx) = trimmed.find(";base64,") {
            return &trimmed[idx + ";base64,".len()..];
        }
    }
    trimmed
}

/// Reduce an accepted payload shape to the single request row it carries.
fn normalize(value: Value) -> Result<Map<String, Value>, InferenceError> {
    match value {
        Value::Object(mut map) => {
            if map.contains_key("image") {
                return Ok(map);
            }
            if let Some(records) = map.remove("dataframe_records") {
                return single_row(records, "dataframe_records");
            }
            if let Some(split) = map.remove("dataframe_split") {
                return split_row(split);
            }
            if let Some(inputs) = map.remove("inputs").or_else(|| map.remove("instances")) {
                return match inputs {
                    Value::Object(row) => Ok(row),
                    other => single_row(other, "inputs"),
                };
            }
            Err(InferenceError::payload("missing field `image`"))
        }
        Value::Array(_) => single_row(value, "payload"),
        _ => Err(InferenceError::payload("expected a JSON object")),
    }
}

fn single_row(value: Value, what: &str) -> Result<Map<String, Value>, InferenceError> {
    match value {
        Value::Array(rows) if rows.len() == 1 => match rows.into_iter().next() {
            Some(Value::Object(row)) => Ok(row),
            _ => Err(InferenceError::payload(format!("{} row must be an object", what))),
        },
        Value::Array(rows) => Err(InferenceError::payload(format!(
            "{} must contain exactly one row, got {}",
            what,
            rows.len()
        ))),
        _ => Err(InferenceError::payload(format!("{} must be an array", what))),
    }
}

#[derive(Deserialize)]
struct DataframeSplit {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

fn split_row(value: Value) -> Result<Map<String, Value>, InferenceError> {
    let split: DataframeSplit = serde_json::from_value(value)
        .map_err(|e| InferenceError::payload(format!("dataframe_split: {}", e)))?;

    let mut rows = split.data.into_iter();
    let row = match (rows.next(), rows.next()) {
        (Some(row), None) => row,
        _ => {
            return Err(InferenceError::payload(
                "dataframe_split must contain exactly one row",
            ))
        }
    };
    if row.len() != split.columns.len() {
        return Err(InferenceError::payload(format!(
            "dataframe_split row has {} values for {} columns",
            row.len(),
            split.columns.len()
        )));
    }

    Ok(split.columns.into_iter().zip(row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<InferenceRequest, InferenceError> {
        InferenceRequest::from_json(value.to_string().as_bytes())
    }

    #[test]
    fn test_direct_mapping_with_defaults() {
        let req = parse(json!({"image": "aGVsbG8=", "boxes": [[1, 2, 3, 4]]})).unwrap();
        assert_eq!(req.image, "aGVsbG8=");
        assert_eq!(req.boxes, vec![BoundingBox::new(1.0, 2.0, 3.0, 4.0)]);
        assert_eq!(req.threshold, DEFAULT_THRESHOLD);
        assert_eq!(req.mask_threshold, DEFAULT_MASK_THRESHOLD);
    }

    #[test]
    fn test_tabular_shapes_match_direct_mapping() {
        let direct = parse(json!({"image": "abc=", "boxes": [[0, 0, 5, 5]], "threshold": 0.3}))
            .unwrap();
        let records = parse(json!({"dataframe_records": [
            {"image": "abc=", "boxes": [[0, 0, 5, 5]], "threshold": 0.3}
        ]}))
        .unwrap();
        let split = parse(json!({"dataframe_split": {
            "columns": ["image", "boxes", "threshold"],
            "data": [["abc=", [[0, 0, 5, 5]], 0.3]]
        }}))
        .unwrap();
        let array = parse(json!([{"image": "abc=", "boxes": [[0, 0, 5, 5]], "threshold": 0.3}]))
            .unwrap();

        assert_eq!(direct, records);
        assert_eq!(direct, split);
        assert_eq!(direct, array);
    }

    #[test]
    fn test_multiple_rows_rejected() {
        let err = parse(json!({"dataframe_records": [
            {"image": "a", "boxes": []},
            {"image": "b", "boxes": []}
        ]}))
        .unwrap_err();
        assert!(err.to_string().contains("exactly one row"));
    }

    #[test]
    fn test_box_arity_and_order_checked() {
        let err = parse(json!({"image": "a", "boxes": [[1, 2, 3]]})).unwrap_err();
        assert!(matches!(err, InferenceError::Validation(_)));

        let err = parse(json!({"image": "a", "boxes": [[10, 0, 5, 5]]})).unwrap_err();
        assert!(err.to_string().contains("x1 <= x2"));
    }

    #[test]
    fn test_coordinates_beyond_f32_range_rejected() {
        let result = parse(json!({"image": "a", "boxes": [[0, 0, 1e300, 1e300]]}));
        assert!(matches!(result, Err(InferenceError::Validation(_))));

        let ok = parse(json!({"image": "a", "boxes": [[0, 0, 3.0e38, 3.0e38]]})).unwrap();
        assert!(ok.boxes[0].x2.is_finite());
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(parse(json!({"image": "a", "boxes": [], "threshold": 1.5})).is_err());
        assert!(parse(json!({"image": "a", "boxes": [], "mask_threshold": -0.1})).is_err());

        let req = parse(json!({"image": "a", "boxes": [], "threshold": 0.0, "mask_threshold": 1.0}))
            .unwrap();
        assert_eq!(req.threshold, 0.0);
        assert_eq!(req.mask_threshold, 1.0);
    }

    #[test]
    fn test_data_url_prefix_stripped() {
        let req = parse(json!({"image": "data:image/png;base64,iVBORw0=", "boxes": []})).unwrap();
        assert_eq!(req.image, "iVBORw0=");
    }

    #[test]
    fn test_not_json_is_payload_error() {
        let err = InferenceRequest::from_json(b"not json").unwrap_err();
        assert!(matches!(err, InferenceError::Payload(_)));
    }
}
