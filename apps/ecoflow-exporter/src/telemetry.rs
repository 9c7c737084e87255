use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] simd_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no params object")]
    MissingParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(f64),
    Unsupported(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: ParamValue,
}

/// Decodes `{"params": {...}}` into its entries, sorted by key.
pub fn parse_params(payload: &mut [u8]) -> Result<Vec<Param>, DecodeError> {
    let value = simd_json::to_borrowed_value(payload)?;
    let BorrowedValue::Object(root) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let Some(BorrowedValue::Object(params)) = root.get("params") else {
        return Err(DecodeError::MissingParams);
    };

    let mut out: Vec<Param> = params
        .iter()
        .map(|(key, value)| Param {
            key: key.to_string(),
            value: classify(value),
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

fn classify(value: &BorrowedValue) -> ParamValue {
    match value {
        BorrowedValue::Array(_) => ParamValue::Unsupported("array"),
        BorrowedValue::Object(_) => ParamValue::Unsupported("object"),
        BorrowedValue::String(_) => ParamValue::Unsupported("string"),
        other => {
            if let Some(flag) = other.as_bool() {
                return ParamValue::Scalar(if flag { 1.0 } else { 0.0 });
            }
            other
                .as_f64()
                .or_else(|| other.as_i64().map(|v| v as f64))
                .or_else(|| other.as_u64().map(|v| v as f64))
                .map(ParamValue::Scalar)
                .unwrap_or(ParamValue::Unsupported("null"))
        }
    }
}
