//! Decoded image containers and responses
//!
//! The pipeline is codec-agnostic: a [`PlatformImage`] is an opaque pixel
//! blob with dimensions and scale, produced by whichever decoder the
//! configuration registers. [`ImageContainer`] wraps it with the metadata
//! the pipeline tracks (original bytes, format tag, preview flag), and
//! [`ImageResponse`] is what subscribers ultimately receive.

use std::collections::HashMap;

use bytes::Bytes;

use crate::request::ImageRequest;

/// Image format tag, sniffed from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Jpeg,
    Png,
    Gif,
    Heif,
    Webp,
    M4v,
}

impl ImageType {
    /// Sniff the format from the first bytes of `data`.
    ///
    /// Returns `None` when no known magic matches; callers treat that as an
    /// unknown format rather than an error.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0xFF, 0xD8]) {
            return Some(Self::Jpeg);
        }
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            return Some(Self::Png);
        }
        if data.starts_with(b"GIF") {
            return Some(Self::Gif);
        }
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Some(Self::Webp);
        }
        // ISO base media files carry an `ftyp` box at offset 4; the brand
        // distinguishes HEIF/HEIC from M4V.
        if data.len() >= 12 && &data[4..8] == b"ftyp" {
            if &data[8..12] == b"M4V " {
                return Some(Self::M4v);
            }
            return Some(Self::Heif);
        }
        None
    }
}

/// Opaque decoded pixel blob with dimensions and display scale.
///
/// The pipeline never inspects the pixel payload; decoders produce it and
/// processors transform it. Width and height may be zero when the decoder
/// chose not to materialize pixels (cost accounting then falls back to the
/// payload length).
#[derive(Debug, Clone, Default)]
pub struct PlatformImage {
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub pixels: Bytes,
}

impl PlatformImage {
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Self {
        Self {
            width,
            height,
            scale: 1.0,
            pixels,
        }
    }
}

/// User-info key under which progressive decoders record the scan number of
/// a preview container.
pub const SCAN_NUMBER_KEY: &str = "scan_number";

/// A decoded image plus the metadata the pipeline tracks for it.
#[derive(Debug, Clone, Default)]
pub struct ImageContainer {
    pub image: PlatformImage,
    /// Original encoded bytes, retained for formats that need them after
    /// decoding (animated images).
    pub data: Option<Bytes>,
    pub image_type: Option<ImageType>,
    /// `true` while further deliveries for the same request are possible;
    /// the final delivery always clears it.
    pub is_preview: bool,
    pub user_info: HashMap<String, serde_json::Value>,
}

impl ImageContainer {
    #[must_use]
    pub fn new(image: PlatformImage) -> Self {
        Self {
            image,
            ..Self::default()
        }
    }

    /// Scan number recorded by a progressive decoder, if any.
    #[must_use]
    pub fn scan_number(&self) -> Option<u64> {
        self.user_info.get(SCAN_NUMBER_KEY).and_then(serde_json::Value::as_u64)
    }

    /// Memory-cache cost of this container, in bytes.
    ///
    /// Four bytes per pixel when dimensions are known; otherwise the raw
    /// payload length as a conservative estimate; never less than 1 so that
    /// opaque entries still count against the limit.
    #[must_use]
    pub fn cost(&self) -> u64 {
        let pixel_cost = 4 * u64::from(self.image.width) * u64::from(self.image.height);
        let fallback = self.image.pixels.len().max(self.data.as_ref().map_or(0, Bytes::len));
        pixel_cost.max(fallback as u64).max(1)
    }
}

/// Transport metadata reported by the data loader.
#[derive(Debug, Clone, Default)]
pub struct DataResponse {
    pub url: Option<String>,
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub expected_length: Option<u64>,
}

impl DataResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` for 2xx responses and for loaders that report no status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code.is_none_or(|code| (200..300).contains(&code))
    }
}

/// Which cache layer satisfied a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Memory,
    Disk,
    /// Not served from a cache: loaded from the origin (network, file or
    /// inline data).
    Origin,
}

/// The final (or preview) artifact delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,
    /// The request that originated this response.
    pub request: ImageRequest,
    pub response: Option<DataResponse>,
    pub cache_source: CacheSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_known_magics() {
        assert_eq!(ImageType::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageType::Jpeg));
        assert_eq!(
            ImageType::sniff(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
            Some(ImageType::Png)
        );
        assert_eq!(ImageType::sniff(b"GIF89a"), Some(ImageType::Gif));
        assert_eq!(ImageType::sniff(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some(ImageType::Webp));
        assert_eq!(ImageType::sniff(b"\x00\x00\x00\x18ftypheic"), Some(ImageType::Heif));
        assert_eq!(ImageType::sniff(b"\x00\x00\x00\x18ftypM4V "), Some(ImageType::M4v));
    }

    #[test]
    fn unknown_bytes_do_not_sniff() {
        assert_eq!(ImageType::sniff(b"not an image"), None);
        assert_eq!(ImageType::sniff(&[]), None);
    }

    #[test]
    fn cost_uses_pixel_dimensions_when_known() {
        let container = ImageContainer::new(PlatformImage::new(10, 10, Bytes::new()));
        assert_eq!(container.cost(), 400);
    }

    #[test]
    fn cost_falls_back_to_payload_length() {
        let mut container =
            ImageContainer::new(PlatformImage::new(0, 0, Bytes::from_static(b"abc")));
        assert_eq!(container.cost(), 3);
        container.data = Some(Bytes::from(vec![0u8; 64]));
        assert_eq!(container.cost(), 64);
    }

    #[test]
    fn minimum_cost_is_one() {
        let container = ImageContainer::default();
        assert_eq!(container.cost(), 1);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut response = DataResponse::default();
        response.headers.insert("ETag".into(), "\"abc\"".into());
        assert_eq!(response.header("etag"), Some("\"abc\""));
    }
}
