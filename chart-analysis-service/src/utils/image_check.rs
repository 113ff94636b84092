//! Validation of uploaded chart images.

use image::ImageFormat;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageCheckError {
    #[error("Chart image is empty")]
    Empty,

    #[error("Chart image is {size} bytes, the limit is {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported chart image format: {0}")]
    Unsupported(String),
}

impl From<ImageCheckError> for AppError {
    fn from(err: ImageCheckError) -> Self {
        match err {
            ImageCheckError::Empty => AppError::BadRequest(anyhow::anyhow!(err)),
            ImageCheckError::TooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            ImageCheckError::Unsupported(_) => AppError::UnsupportedMediaType(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
}

impl ChartFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ChartFormat::Png => "image/png",
            ChartFormat::Jpeg => "image/jpeg",
            ChartFormat::Webp => "image/webp",
            ChartFormat::Gif => "image/gif",
        }
    }

    fn from_sniffed(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(ChartFormat::Png),
            ImageFormat::Jpeg => Some(ChartFormat::Jpeg),
            ImageFormat::WebP => Some(ChartFormat::Webp),
            ImageFormat::Gif => Some(ChartFormat::Gif),
            _ => None,
        }
    }
}

/// Check size and sniff the real format from the magic bytes.
///
/// The declared MIME type is only used for the error message; bots routinely
/// send `application/octet-stream` for photos.
pub fn check_chart_image(
    bytes: &[u8],
    declared_mime: Option<&str>,
    max_bytes: usize,
) -> Result<ChartFormat, ImageCheckError> {
    if bytes.is_empty() {
        return Err(ImageCheckError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(ImageCheckError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let format = image::guess_format(bytes)
        .ok()
        .and_then(ChartFormat::from_sniffed)
        .ok_or_else(|| {
            ImageCheckError::Unsupported(declared_mime.unwrap_or("unknown").to_string())
        })?;

    if let Some(declared) = declared_mime {
        if declared.starts_with("image/") && declared != format.mime_type() {
            tracing::debug!(
                declared = %declared,
                sniffed = %format.mime_type(),
                "Declared image type differs from content"
            );
        }
    }

    Ok(format)
}
