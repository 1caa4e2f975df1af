//! Upload request validation.
//!
//! Runs once per item before any store is touched. A non-empty result aborts
//! the whole upload call.

use crate::models::{image::file_extension, upload::UploadRequest};
use serde::Serialize;
use std::fmt;

pub const ALLOWED_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];
pub const MAX_FILE_SIZE_BYTES: usize = 10 * 1024 * 1024;
pub const MIN_DURATION_MINUTES: f64 = 1.0;
pub const MAX_DURATION_MINUTES: f64 = 60.0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate(request: &UploadRequest) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if request.file_name.trim().is_empty() {
        errors.push(ValidationError::new("file", "file name is required"));
    } else {
        let allowed = file_extension(&request.file_name)
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()));
        if !allowed {
            errors.push(ValidationError::new(
                "file",
                format!(
                    "invalid file extension, allowed: {}",
                    ALLOWED_EXTENSIONS.join(", ")
                ),
            ));
        }
    }

    if request.bytes.is_empty() {
        errors.push(ValidationError::new("file", "file is empty"));
    } else if request.bytes.len() > MAX_FILE_SIZE_BYTES {
        errors.push(ValidationError::new(
            "file",
            format!("file exceeds {} bytes", MAX_FILE_SIZE_BYTES),
        ));
    }

    // NaN fails `contains`, infinities fall outside the range
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&request.duration_minutes) {
        errors.push(ValidationError::new(
            "duration_minutes",
            format!(
                "duration must be between {} and {} minutes",
                MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
            ),
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_request() {
        for minutes in [1.0, 1.5, 30.0, 60.0] {
            let req = UploadRequest::new("photo.JPG", vec![1u8, 2, 3], minutes);
            assert!(validate(&req).is_empty(), "{minutes} minutes");
        }
    }

    #[test]
    fn rejects_duration_out_of_range() {
        for minutes in [0.0, 0.5, 0.999, -5.0, 60.01, f64::NAN, f64::INFINITY] {
            let errors = validate(&UploadRequest::new("a.png", vec![1u8], minutes));
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].field, "duration_minutes");
        }
    }

    #[test]
    fn rejects_bad_extension_and_empty_file() {
        let errors = validate(&UploadRequest::new("notes.txt", Vec::<u8>::new(), 5.0));
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.field == "file"));
    }

    #[test]
    fn rejects_missing_name_and_oversize() {
        let big = vec![0u8; MAX_FILE_SIZE_BYTES + 1];
        let errors = validate(&UploadRequest::new("  ", big, 5.0));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("required"));
        assert!(errors[1].message.contains("exceeds"));
    }
}
