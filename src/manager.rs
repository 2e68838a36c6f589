//! Ownership of the loaded diffusion model.
//!
//! A [`ModelManager`] holds at most one model for its lifetime. It is meant to
//! be constructed once and moved into the [`crate::Orchestrator`], which is
//! what keeps a single model per process without a global.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::Result;
use image::DynamicImage;
use tracing::{debug, error, info};

use crate::{
    model::{verify_artifacts, ArtifactReport},
    utils::ExecutionTarget,
    ImagenError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Loading,
    Ready,
    Error,
}

impl ModelStatus {
    pub fn banner(&self) -> &'static str {
        match self {
            Self::Loading => "⏳ Loading Model...",
            Self::Ready => "✅ Model Ready",
            Self::Error => "❌ Model Error",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A loaded text-to-image model.
pub trait ImageModel {
    fn generate(
        &mut self,
        prompt: &str,
        steps: usize,
        guidance_scale: f64,
        width: usize,
        height: usize,
    ) -> Result<DynamicImage>;

    /// Makes the following generations reproducible.
    fn set_seed(&mut self, seed: u64) -> Result<()>;
}

/// Builds an [`ImageModel`] from files that are already on disk.
pub trait Loader {
    type Model: ImageModel;

    fn load(&self, root: &Path, target: ExecutionTarget) -> Result<Self::Model>;
}

pub struct ModelManager<L: Loader> {
    loader: L,
    root: PathBuf,
    force_cpu: bool,
    model: Option<L::Model>,
    status: ModelStatus,
    report: ArtifactReport,
    last_error: Option<String>,
}

impl<L: Loader> ModelManager<L> {
    pub fn new(loader: L, root: impl Into<PathBuf>, force_cpu: bool) -> Self {
        Self {
            loader,
            root: root.into(),
            force_cpu,
            model: None,
            status: ModelStatus::Loading,
            report: ArtifactReport::default(),
            last_error: None,
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Files found missing by the last verification.
    pub fn missing(&self) -> &[&'static str] {
        &self.report.missing
    }

    pub fn verify_artifacts(&mut self) -> bool {
        self.report = verify_artifacts(&self.root);
        self.report.is_complete()
    }

    pub fn load(&mut self) -> bool {
        self.status = ModelStatus::Loading;
        self.cleanup();
        if !self.verify_artifacts() {
            error!("model files not found, run `imagen fetch` first");
            self.status = ModelStatus::Error;
            self.last_error = Some(format!("missing {}", self.report.missing.join(", ")));
            return false;
        }

        let target = ExecutionTarget::detect(self.force_cpu);
        info!("loading model from {} on {target}", self.root.display());
        match self.loader.load(&self.root, target) {
            Ok(model) => {
                self.model = Some(model);
                self.status = ModelStatus::Ready;
                self.last_error = None;
                info!("model loaded");
                true
            }
            Err(e) => {
                error!("error loading model: {e:?}");
                self.status = ModelStatus::Error;
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// The error that made the last [`Self::load`] fail.
    pub fn load_error(&self) -> ImagenError {
        if !self.report.is_complete() {
            return ImagenError::MissingArtifacts {
                root: self.root.clone(),
                missing: self.report.missing.clone(),
            };
        }
        let reason = self
            .last_error
            .clone()
            .unwrap_or_else(|| "model is not loaded".to_string());
        ImagenError::Load(reason)
    }

    pub fn reseed(&mut self, seed: u64) -> bool {
        let Some(model) = self.model.as_mut() else {
            return false;
        };
        match model.set_seed(seed) {
            Ok(()) => true,
            Err(e) => {
                error!("error seeding model: {e:?}");
                false
            }
        }
    }

    pub fn generate(
        &mut self,
        prompt: &str,
        steps: usize,
        guidance_scale: f64,
        width: usize,
        height: usize,
    ) -> Option<DynamicImage> {
        let Some(model) = self.model.as_mut() else {
            error!("model not loaded");
            self.last_error = Some("model is not loaded".to_string());
            return None;
        };
        info!("generating image with prompt: {prompt}");
        debug!("steps={steps}, guidance_scale={guidance_scale}, size={width}x{height}");
        match model.generate(prompt, steps, guidance_scale, width, height) {
            Ok(image) => {
                info!("image generated");
                Some(image)
            }
            Err(e) => {
                error!("error generating image: {e:?}");
                self.last_error = Some(e.to_string());
                None
            }
        }
    }

    /// Cause of the last failed [`Self::generate`] call.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn set_status(&mut self, status: ModelStatus) {
        self.status = status;
    }

    /// Drops the model, which releases its device buffers.
    pub fn cleanup(&mut self) {
        if self.model.take().is_some() {
            self.status = ModelStatus::Loading;
            info!("model resources cleaned up");
        }
    }
}

impl<L: Loader> Drop for ModelManager<L> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelFile;
    use std::{cell::Cell, rc::Rc};

    struct Solid;

    impl ImageModel for Solid {
        fn generate(&mut self, _: &str, _: usize, _: f64, w: usize, h: usize) -> Result<DynamicImage> {
            Ok(DynamicImage::new_rgb8(w as u32, h as u32))
        }

        fn set_seed(&mut self, _: u64) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        calls: Rc<Cell<usize>>,
        fail: bool,
    }

    impl Loader for CountingLoader {
        type Model = Solid;

        fn load(&self, _: &Path, _: ExecutionTarget) -> Result<Solid> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                anyhow::bail!("out of memory");
            }
            Ok(Solid)
        }
    }

    fn populated_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in ModelFile::ALL {
            let path = file.path_in(dir.path());
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"{}").unwrap();
        }
        dir
    }

    #[test]
    fn missing_files_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let loader = CountingLoader::default();
        let calls = loader.calls.clone();
        let mut manager = ModelManager::new(loader, dir.path(), true);
        assert_eq!(manager.status(), ModelStatus::Loading);

        assert!(!manager.load());
        assert_eq!(manager.status(), ModelStatus::Error);
        assert_eq!(calls.get(), 0);
        assert!(manager.missing().contains(&"model_index.json"));
        assert!(matches!(manager.load_error(), ImagenError::MissingArtifacts { .. }));
        assert!(manager.generate("a cat", 4, 1.0, 64, 64).is_none());
    }

    #[test]
    fn loader_failure_becomes_error_status() {
        let dir = populated_root();
        let loader = CountingLoader { fail: true, ..Default::default() };
        let mut manager = ModelManager::new(loader, dir.path(), true);

        assert!(!manager.load());
        assert_eq!(manager.status(), ModelStatus::Error);
        match manager.load_error() {
            ImagenError::Load(reason) => assert_eq!(reason, "out of memory"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn load_generate_cleanup() {
        let dir = populated_root();
        let mut manager = ModelManager::new(CountingLoader::default(), dir.path(), true);

        assert!(manager.load());
        assert_eq!(manager.status(), ModelStatus::Ready);
        let image = manager.generate("a cat", 4, 1.0, 64, 32).unwrap();
        assert_eq!((image.width(), image.height()), (64, 32));
        assert!(manager.reseed(42));

        manager.cleanup();
        assert!(!manager.is_loaded());
        manager.cleanup();
        assert!(manager.generate("a cat", 4, 1.0, 64, 32).is_none());
        assert!(!manager.reseed(42));
    }

    #[test]
    fn banners() {
        assert_eq!(ModelStatus::Ready.banner(), "✅ Model Ready");
        assert_eq!(ModelStatus::Error.to_string(), "error");
    }
}
