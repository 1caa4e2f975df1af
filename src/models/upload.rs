//! Upload request payload handed from the HTTP layer to the orchestrator.

use bytes::Bytes;

/// One file of an upload call.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub file_name: String,
    pub bytes: Bytes,
    /// Requested lifetime in minutes, fractions allowed. Range-checked by validation.
    pub duration_minutes: f64,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>, duration_minutes: f64) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
            duration_minutes,
        }
    }
}
