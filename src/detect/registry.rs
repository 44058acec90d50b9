use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::config::DetectionSettings;
use crate::detect::result::Detection;
use crate::geometry::BoundingBox;

use super::backend::DetectorBackend;
use super::backends::StubBackend;

type BackendFactory = fn(&DetectionSettings) -> Result<Box<dyn DetectorBackend>>;

/// Registry of detector backend constructors, keyed by name.
///
/// The registry only builds backends; the built backend is owned exclusively
/// by the inference loop.
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("stub", build_stub);
        #[cfg(feature = "backend-tract")]
        registry.register("tract", build_tract);
        registry
    }

    /// Register a backend constructor. Re-registering a name replaces it.
    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build the backend named in `settings`.
    pub fn build(&self, settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.factories.get(&settings.backend).ok_or_else(|| {
            anyhow!(
                "backend '{}' not registered (available: {})",
                settings.backend,
                self.list().join(", ")
            )
        })?;
        let backend = factory(settings)?;
        let input = backend.input_size();
        if input != (settings.input_width, settings.input_height) {
            return Err(anyhow!(
                "backend '{}' input {}x{} does not match configured {}x{}",
                backend.name(),
                input.0,
                input.1,
                settings.input_width,
                settings.input_height
            ));
        }
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dry-run stub: a confident centred detection of the first configured label
/// on every other frame.
fn build_stub(settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    let (width, height) = (settings.input_width as i32, settings.input_height as i32);
    let label = settings.labels.keys().next().copied().unwrap_or(1);
    let centred = Detection {
        label,
        probability: 0.9,
        bbox: BoundingBox::new(width / 3, height / 3, 2 * width / 3, 2 * height / 3),
    };
    Ok(Box::new(
        StubBackend::new(settings.input_width, settings.input_height)
            .with_script(vec![vec![centred], Vec::new()]),
    ))
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires detection.model_path"))?;
    Ok(Box::new(super::backends::TractBackend::new(
        model_path,
        settings.input_width,
        settings.input_height,
    )?))
}
