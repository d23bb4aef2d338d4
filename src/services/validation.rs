use crate::models::job::ImageType;

/// Largest accepted upload, in bytes.
pub const MAX_UPLOAD_BYTES: u64 = 10_000_000;

/// Number of leading bytes kept for format sniffing.
pub const SNIFF_LEN: usize = 16;

/// Resolve the declared multipart content type to a supported image type.
///
/// Parameters after `;` are ignored, so `image/png; name=x` is accepted.
pub fn parse_content_type(declared: Option<&str>) -> Result<ImageType, ValidationError> {
    let declared = declared.unwrap_or_default();
    let essence = declared.split(';').next().unwrap_or_default().trim();
    essence
        .parse()
        .map_err(|_| ValidationError::UnsupportedType(declared.to_string()))
}

/// Fail once the running byte count passes the upload cap.
pub fn check_size(received: u64) -> Result<(), ValidationError> {
    if received > MAX_UPLOAD_BYTES {
        return Err(ValidationError::TooLarge {
            limit: MAX_UPLOAD_BYTES,
        });
    }
    Ok(())
}

/// Check that the leading bytes of the upload match the declared image type.
pub fn check_signature(declared: ImageType, head: &[u8]) -> Result<(), ValidationError> {
    if head.is_empty() {
        return Err(ValidationError::Empty);
    }
    match image::guess_format(head) {
        Ok(format) if format == declared.image_format() => Ok(()),
        Ok(format) => Err(ValidationError::SignatureMismatch {
            declared,
            detected: format!("{format:?}"),
        }),
        Err(_) => Err(ValidationError::SignatureMismatch {
            declared,
            detected: "unknown".to_string(),
        }),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("bad image type: {0:?}")]
    UnsupportedType(String),

    #[error("file too big (limit is {limit} bytes)")]
    TooLarge { limit: u64 },

    #[error("empty upload")]
    Empty,

    #[error("file content does not look like {declared} (detected {detected})")]
    SignatureMismatch { declared: ImageType, detected: String },

    #[error("missing \"file\" field in upload")]
    MissingFile,
}
