//! Downstream identification of kept artifacts against a reference face.
//!
//! A kept crop is fetched back from the object store and compared with a
//! configured reference image in the same bucket. A comparison at or above the
//! similarity threshold is a match and is announced with a `MATCH:` notice.

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::artifact::ObjectStore;
use crate::config::IdentifySettings;
use crate::review::RecordArtifact;
use crate::telemetry::TelemetryPublisher;

const THUMBNAIL_SIDE: u32 = 32;

/// Scores how alike two face crops are.
pub trait FaceMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Similarity on a 0-100 scale, or `None` when the images cannot be
    /// compared.
    fn similarity(&self, source: &RgbImage, target: &RgbImage) -> Result<Option<f64>>;
}

/// Matcher for dry runs and tests: compares small grayscale thumbnails by
/// mean absolute difference. It knows nothing about faces.
#[derive(Clone, Debug)]
pub struct ThumbnailMatcher {
    side: u32,
}

impl Default for ThumbnailMatcher {
    fn default() -> Self {
        Self {
            side: THUMBNAIL_SIDE,
        }
    }
}

impl ThumbnailMatcher {
    fn thumbnail(&self, image: &RgbImage) -> GrayImage {
        let gray = imageops::grayscale(image);
        imageops::resize(&gray, self.side, self.side, FilterType::Triangle)
    }
}

impl FaceMatcher for ThumbnailMatcher {
    fn name(&self) -> &'static str {
        "thumbnail"
    }

    fn similarity(&self, source: &RgbImage, target: &RgbImage) -> Result<Option<f64>> {
        if source.width() == 0 || source.height() == 0 || target.width() == 0 || target.height() == 0
        {
            return Ok(None);
        }
        let a = self.thumbnail(source);
        let b = self.thumbnail(target);
        let total: u64 = a
            .pixels()
            .zip(b.pixels())
            .map(|(p, q)| u64::from(p[0].abs_diff(q[0])))
            .sum();
        let mean = total as f64 / f64::from(self.side * self.side);
        Ok(Some(100.0 * (1.0 - mean / 255.0)))
    }
}

/// A kept artifact that matched the reference image.
#[derive(Clone, Debug, PartialEq)]
pub struct Identification {
    pub bucket: String,
    pub key: String,
    pub probability: f64,
    pub similarity: f64,
}

impl Identification {
    pub fn notice(&self) -> String {
        format!(
            "Recognized someone matching: {} {:.2}",
            self.key, self.similarity
        )
    }
}

pub struct Identifier {
    store: Box<dyn ObjectStore>,
    matcher: Box<dyn FaceMatcher>,
    target_key: String,
    similarity_threshold: f64,
}

impl Identifier {
    /// `None` when no reference image is configured.
    pub fn from_settings(
        settings: &IdentifySettings,
        store: Box<dyn ObjectStore>,
        matcher: Box<dyn FaceMatcher>,
    ) -> Option<Self> {
        let target_key = settings.target_key.clone()?;
        Some(Self {
            store,
            matcher,
            target_key,
            similarity_threshold: settings.similarity_threshold,
        })
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    /// Compare `artifact` with the reference image from the same bucket.
    pub fn identify(&self, artifact: &RecordArtifact) -> Result<Option<Identification>> {
        let source = self.load(&artifact.bucket, &artifact.key)?;
        let target = self.load(&artifact.bucket, &self.target_key)?;
        let Some(similarity) = self.matcher.similarity(&source, &target)? else {
            log::debug!("{} could not compare {}", self.matcher.name(), artifact.key);
            return Ok(None);
        };
        log::debug!(
            "{} similarity {:.2} for {}/{}",
            self.matcher.name(),
            similarity,
            artifact.bucket,
            artifact.key
        );
        if similarity < self.similarity_threshold {
            return Ok(None);
        }
        Ok(Some(Identification {
            bucket: artifact.bucket.clone(),
            key: artifact.key.clone(),
            probability: artifact.probability,
            similarity,
        }))
    }

    /// Identify and announce a match on `telemetry`. Returns whether it matched.
    pub fn identify_and_notify(
        &self,
        artifact: &RecordArtifact,
        telemetry: &TelemetryPublisher,
    ) -> Result<bool> {
        match self.identify(artifact)? {
            Some(found) => {
                log::info!("{}", found.notice());
                telemetry.matched(&found.notice());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn load(&self, bucket: &str, key: &str) -> Result<RgbImage> {
        let bytes = self.store.fetch(bucket, key)?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("decode {}/{}", bucket, key))?;
        Ok(image.into_rgb8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryObjectStore;
    use crate::telemetry::{MemoryChannel, MATCH_PREFIX};
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    const BUCKET: &str = "edgelens-faces";

    fn png(color: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(40, 30, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn identifier(store: &MemoryObjectStore) -> Identifier {
        Identifier::from_settings(
            &IdentifySettings {
                target_key: Some("reference/owner.png".to_string()),
                similarity_threshold: 80.0,
                topic_template: "devices/{device_id}/identified".to_string(),
            },
            Box::new(store.clone()),
            Box::new(ThumbnailMatcher::default()),
        )
        .unwrap()
    }

    fn artifact(key: &str) -> RecordArtifact {
        RecordArtifact {
            probability: 0.95,
            bucket: BUCKET.to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn matching_crop_is_announced() {
        let store = MemoryObjectStore::new();
        store.put(BUCKET, "reference/owner.png", &png([180, 120, 90])).unwrap();
        store.put(BUCKET, "faces/a.png", &png([182, 121, 90])).unwrap();
        let channel = MemoryChannel::new();
        let telemetry = TelemetryPublisher::new(Box::new(channel.clone()), "devices/lens-01/identified");

        let matched = identifier(&store)
            .identify_and_notify(&artifact("faces/a.png"), &telemetry)
            .unwrap();
        assert!(matched);
        let notices = channel.notices(MATCH_PREFIX);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("MATCH: Recognized someone matching: faces/a.png "));
    }

    #[test]
    fn dissimilar_crop_is_not_announced() {
        let store = MemoryObjectStore::new();
        store.put(BUCKET, "reference/owner.png", &png([0, 0, 0])).unwrap();
        store.put(BUCKET, "faces/b.png", &png([255, 255, 255])).unwrap();
        let channel = MemoryChannel::new();
        let telemetry = TelemetryPublisher::new(Box::new(channel.clone()), "devices/lens-01/identified");

        let identifier = identifier(&store);
        assert_eq!(identifier.identify(&artifact("faces/b.png")).unwrap(), None);
        assert!(!identifier
            .identify_and_notify(&artifact("faces/b.png"), &telemetry)
            .unwrap());
        assert!(channel.published().is_empty());
    }

    #[test]
    fn missing_reference_is_an_error() {
        let store = MemoryObjectStore::new();
        store.put(BUCKET, "faces/a.png", &png([10, 10, 10])).unwrap();
        assert!(identifier(&store).identify(&artifact("faces/a.png")).is_err());
    }

    #[test]
    fn identification_needs_a_reference_key() {
        let settings = IdentifySettings {
            target_key: None,
            similarity_threshold: 80.0,
            topic_template: "devices/{device_id}/identified".to_string(),
        };
        assert!(Identifier::from_settings(
            &settings,
            Box::new(MemoryObjectStore::new()),
            Box::new(ThumbnailMatcher::default()),
        )
        .is_none());
    }

    #[test]
    fn thumbnail_similarity_spans_full_scale() {
        let matcher = ThumbnailMatcher::default();
        let black = RgbImage::from_pixel(16, 16, Rgb([0, 0, 0]));
        let white = RgbImage::from_pixel(8, 24, Rgb([255, 255, 255]));
        assert_eq!(matcher.similarity(&black, &black).unwrap(), Some(100.0));
        assert_eq!(matcher.similarity(&black, &white).unwrap(), Some(0.0));
        assert_eq!(matcher.similarity(&RgbImage::new(0, 0), &black).unwrap(), None);
    }
}
