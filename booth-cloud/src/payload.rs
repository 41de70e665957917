//! Image payload helpers: data URLs, upload size cap, re-encoding and checksums.

use crate::error::RemoteError;
use base64::Engine;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType};
use sha2::{Digest, Sha256};

/// Hard cap on a single uploaded payload
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Decoded `data:<mime>;base64,<payload>` URL
#[derive(Debug, Clone, PartialEq)]
pub struct DataUrl {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl DataUrl {
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }

    /// Whether `value` looks like an embedded payload rather than a remote URL
    pub fn is_data_url(value: &str) -> bool {
        value.starts_with("data:")
    }

    pub fn parse(value: &str) -> Result<Self, RemoteError> {
        let rest = value
            .strip_prefix("data:")
            .ok_or_else(|| RemoteError::BadRequest("Not a data URL".to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| RemoteError::BadRequest("Data URL without payload".to_string()))?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or_else(|| RemoteError::BadRequest("Data URL is not base64 encoded".to_string()))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| RemoteError::BadRequest(format!("Invalid base64 payload: {}", e)))?;

        let mime = if mime.is_empty() {
            "application/octet-stream"
        } else {
            mime
        };
        Ok(Self::new(mime, bytes))
    }

    /// Length of the textual data URL, the measure browsers use for size limits
    pub fn encoded_len(&self) -> usize {
        "data:;base64,".len() + self.mime.len() + self.bytes.len().div_ceil(3) * 4
    }

    /// File extension matching the MIME type
    pub fn extension(&self) -> &'static str {
        match self.mime.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "jpg",
        }
    }
}

impl std::fmt::Display for DataUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "data:{};base64,{}",
            self.mime,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Rejects payloads above `limit` bytes as terminal
pub fn ensure_within_limit(size: usize, limit: usize) -> Result<(), RemoteError> {
    if size > limit {
        return Err(RemoteError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Hex encoded SHA-256 of a payload
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Parameters for upload compression
#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// Longest edge after downscaling
    pub max_dimension: u32,
    /// Target size of the encoded data URL in bytes
    pub target_bytes: usize,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            max_dimension: 1200,
            target_bytes: 800 * 1024,
        }
    }
}

const START_QUALITY: u8 = 80;
const MIN_QUALITY: u8 = 30;
const QUALITY_STEP: u8 = 10;

/// Re-encodes an image as JPEG, downscaled and stepped down in quality until
/// it fits `target_bytes` or quality reaches its floor.
///
/// Payloads that cannot be decoded are returned unchanged. Runs on the
/// blocking pool.
pub async fn compress(payload: DataUrl, options: CompressOptions) -> DataUrl {
    let original = payload.clone();
    let result = tokio::task::spawn_blocking(move || compress_blocking(&payload, &options)).await;

    match result {
        Ok(Ok(compressed)) => compressed,
        Ok(Err(e)) => {
            log::warn!("Image compression skipped: {}", e);
            original
        }
        Err(e) => {
            log::warn!("Image compression task failed: {}", e);
            original
        }
    }
}

fn compress_blocking(payload: &DataUrl, options: &CompressOptions) -> Result<DataUrl, String> {
    let img = image::load_from_memory(&payload.bytes)
        .map_err(|e| format!("Failed to load image: {}", e))?;

    let img = if img.width() > options.max_dimension || img.height() > options.max_dimension {
        img.resize(
            options.max_dimension,
            options.max_dimension,
            FilterType::Triangle,
        )
    } else {
        img
    };
    let rgb = img.to_rgb8();

    let mut quality = START_QUALITY;
    let mut encoded = encode_jpeg(&rgb, quality)?;
    while encoded.encoded_len() > options.target_bytes && quality > MIN_QUALITY {
        quality -= QUALITY_STEP;
        encoded = encode_jpeg(&rgb, quality)?;
    }

    log::debug!(
        "Compressed image {} KB -> {} KB (quality {})",
        payload.encoded_len() / 1024,
        encoded.encoded_len() / 1024,
        quality
    );
    Ok(encoded)
}

fn encode_jpeg(rgb: &image::RgbImage, quality: u8) -> Result<DataUrl, String> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(rgb)
        .map_err(|e| format!("Failed to encode JPEG: {}", e))?;
    Ok(DataUrl::new("image/jpeg", buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_data_url(width: u32, height: u32) -> DataUrl {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        });
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageFormat::Png).unwrap();
        DataUrl::new("image/png", buffer.into_inner())
    }

    #[test]
    fn test_parse_and_format() {
        let url = "data:image/png;base64,AAEC";
        let parsed = DataUrl::parse(url).unwrap();
        assert_eq!(parsed.mime, "image/png");
        assert_eq!(parsed.bytes, vec![0, 1, 2]);
        assert_eq!(parsed.to_string(), url);
        assert_eq!(parsed.encoded_len(), url.len());
        assert_eq!(parsed.extension(), "png");
    }

    #[test]
    fn test_parse_rejects_remote_urls() {
        assert!(DataUrl::parse("https://example.com/a.png").is_err());
        assert!(DataUrl::parse("data:image/png,raw").is_err());
        assert!(!DataUrl::is_data_url("/.netlify/blobs/designs/x"));
    }

    #[test]
    fn test_size_cap_is_terminal() {
        assert!(ensure_within_limit(MAX_UPLOAD_BYTES, MAX_UPLOAD_BYTES).is_ok());
        let err = ensure_within_limit(MAX_UPLOAD_BYTES + 1, MAX_UPLOAD_BYTES).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_compress_downscales_to_jpeg() {
        let payload = png_data_url(1600, 800);
        let compressed = compress(payload, CompressOptions::default()).await;

        assert_eq!(compressed.mime, "image/jpeg");
        let img = image::load_from_memory(&compressed.bytes).unwrap();
        assert_eq!(img.width(), 1200);
        assert_eq!(img.height(), 600);
    }

    #[tokio::test]
    async fn test_compress_keeps_undecodable_payload() {
        let payload = DataUrl::new("image/jpeg", vec![1, 2, 3, 4]);
        let result = compress(payload.clone(), CompressOptions::default()).await;
        assert_eq!(result, payload);
    }
}
