use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body returned by the backend for rejected requests.
///
/// `detail` is usually a string, but validation failures carry a list of
/// objects, so it is kept as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: Value,
}

impl ErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}
