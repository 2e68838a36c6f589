use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::ValueEnum;
use tracing::{error, info, warn};

use crate::{
    manager::{Loader, ModelManager, ModelStatus},
    utils::{output_filename, unix_timestamp},
    ImagenError,
};

pub const MIN_STEPS: usize = 2;
pub const MAX_STEPS: usize = 15;

pub const EXAMPLE_PROMPTS: [&str; 5] = [
    "A serene landscape with mountains and a lake at sunset, digital art",
    "Cyberpunk cityscape with neon lights and flying cars",
    "Magical forest with glowing mushrooms and fairy lights",
    "Abstract geometric patterns in vibrant colors",
    "Portrait of a futuristic robot with expressive eyes",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StylePreset {
    Photorealistic,
    Anime,
    DigitalArt,
    Abstract,
}

impl StylePreset {
    /// Matching order when a prompt mentions several presets.
    pub const ALL: [StylePreset; 4] = [
        Self::Photorealistic,
        Self::Anime,
        Self::DigitalArt,
        Self::Abstract,
    ];

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Photorealistic => "Photorealistic",
            Self::Anime => "Anime",
            Self::DigitalArt => "Digital Art",
            Self::Abstract => "Abstract",
        }
    }

    pub fn descriptor(&self) -> &'static str {
        match self {
            Self::Photorealistic => "photorealistic, highly detailed, 8k uhd",
            Self::Anime => "anime style, vibrant colors, detailed illustration",
            Self::DigitalArt => "digital art, trending on artstation, highly detailed",
            Self::Abstract => "abstract art, modern, contemporary, artistic",
        }
    }

    /// The first preset whose keyword appears in `prompt`, ignoring case.
    pub fn detect(prompt: &str) -> Option<Self> {
        let lower = prompt.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|style| lower.contains(&style.keyword().to_lowercase()))
    }

    /// Quick-insert: appends the descriptor, or uses it alone for an empty prompt.
    pub fn insert_into(&self, prompt: &str) -> String {
        if prompt.is_empty() {
            self.descriptor().to_string()
        } else {
            format!("{prompt}, {}", self.descriptor())
        }
    }
}

/// Appends the descriptor of the detected preset to `prompt` in place.
///
/// The working prompt is shared across a batch, so once a descriptor has
/// been added it stays for every later image and is not added again.
pub fn apply_style_preset(prompt: &mut String) -> Option<StylePreset> {
    let style = StylePreset::detect(prompt)?;
    if !prompt.contains(style.descriptor()) {
        prompt.push_str(", ");
        prompt.push_str(style.descriptor());
    }
    Some(style)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    S256,
    S512,
    S768,
}

impl ImageSize {
    pub const ALL: [ImageSize; 3] = [Self::S256, Self::S512, Self::S768];

    pub fn side(&self) -> usize {
        match self {
            Self::S256 => 256,
            Self::S512 => 512,
            Self::S768 => 768,
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = self.side();
        write!(f, "{side}x{side}")
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|size| size.to_string() == s.trim())
            .ok_or_else(|| format!("unsupported size {s:?}, expected 256x256, 512x512 or 768x768"))
    }
}

/// Maps the 1-10 quality dial onto an inference step count, truncating
/// the half steps.
pub fn map_quality_to_steps(quality: u8) -> usize {
    let steps = (2.0 + (f64::from(quality) - 1.0) * 1.5).trunc();
    (steps.max(0.0) as usize).clamp(MIN_STEPS, MAX_STEPS)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub quality: u8,
    pub size: ImageSize,
    pub guidance_scale: f64,
    /// -1 leaves the noise generator unseeded.
    pub seed: i64,
    pub batch_count: u8,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<(), ImagenError> {
        if self.prompt.trim().is_empty() {
            return Err(ImagenError::InvalidRequest("Please enter a prompt".to_string()));
        }
        if !(1..=10).contains(&self.quality) {
            return Err(ImagenError::InvalidRequest(format!(
                "quality should be between 1 and 10, got {}",
                self.quality
            )));
        }
        if !crate::GUIDANCE_SCALE_RANGE.contains(&self.guidance_scale) {
            return Err(ImagenError::InvalidRequest(format!(
                "guidance scale should be between 0.5 and 2.0, got {}",
                self.guidance_scale
            )));
        }
        if self.seed < -1 {
            return Err(ImagenError::InvalidRequest(format!(
                "seed should be -1 or non-negative, got {}",
                self.seed
            )));
        }
        if !(1..=4).contains(&self.batch_count) {
            return Err(ImagenError::InvalidRequest(format!(
                "batch count should be between 1 and 4, got {}",
                self.batch_count
            )));
        }
        Ok(())
    }

    pub fn fixed_seed(&self) -> Option<u64> {
        u64::try_from(self.seed).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub path: PathBuf,
    pub label: String,
    /// Prompt the model actually received, presets included.
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub images: Vec<GeneratedImage>,
    pub status: ModelStatus,
}

pub struct Orchestrator<L: Loader> {
    manager: ModelManager<L>,
    output_dir: PathBuf,
}

impl<L: Loader> Orchestrator<L> {
    pub fn new(manager: ModelManager<L>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            output_dir: output_dir.into(),
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.manager.status()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn manager(&self) -> &ModelManager<L> {
        &self.manager
    }

    /// Loads the model unless a handle is already held.
    pub fn initialize(&mut self) -> Result<(), ImagenError> {
        if self.manager.is_loaded() {
            return Ok(());
        }
        if !self.manager.load() {
            let err = self.manager.load_error();
            error!("error initializing generator: {err}");
            return Err(err);
        }
        info!("image generator initialized");
        Ok(())
    }

    pub fn generate_batch(&mut self, request: &GenerationRequest) -> Result<BatchOutcome, ImagenError> {
        request.validate()?;
        self.initialize()?;

        let steps = map_quality_to_steps(request.quality);
        let side = request.size.side();
        if let Some(seed) = request.fixed_seed() {
            if !self.manager.reseed(seed) {
                warn!("could not seed the model, output will not be reproducible");
            }
        }
        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            error!("could not create {}: {e}", self.output_dir.display());
            self.manager.set_status(ModelStatus::Error);
            return Err(e.into());
        }

        let mut prompt = request.prompt.clone();
        let mut images = Vec::with_capacity(request.batch_count as usize);
        for index in 0..request.batch_count as usize {
            apply_style_preset(&mut prompt);

            let Some(image) =
                self.manager
                    .generate(&prompt, steps, request.guidance_scale, side, side)
            else {
                let reason = self
                    .manager
                    .last_error()
                    .unwrap_or("Failed to generate image")
                    .to_string();
                return Err(self.fail(index, reason));
            };

            let path = output_filename(&self.output_dir, unix_timestamp(), index);
            if let Err(e) = image.save(&path) {
                return Err(self.fail(index, format!("could not write {}: {e}", path.display())));
            }
            info!("saved {}", path.display());
            images.push(GeneratedImage {
                path,
                label: format!("Image {}", index + 1),
                prompt: prompt.clone(),
            });
        }

        self.manager.set_status(ModelStatus::Ready);
        Ok(BatchOutcome {
            images,
            status: self.manager.status(),
        })
    }

    /// Aborts the batch at `index` (zero-based) and marks the model as failed.
    fn fail(&mut self, index: usize, reason: String) -> ImagenError {
        error!("error generating image {}: {reason}", index + 1);
        self.manager.set_status(ModelStatus::Error);
        ImagenError::Generation {
            index: index + 1,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_mapping_endpoints_and_monotonic() {
        let steps: Vec<usize> = (1..=10).map(map_quality_to_steps).collect();
        assert_eq!(steps, vec![2, 3, 5, 6, 8, 9, 11, 12, 14, 15]);
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
        assert!(steps.iter().all(|s| (MIN_STEPS..=MAX_STEPS).contains(s)));
    }

    #[test]
    fn quality_mapping_clamps_out_of_range() {
        assert_eq!(map_quality_to_steps(0), 2);
        assert_eq!(map_quality_to_steps(255), 15);
        assert_eq!(map_quality_to_steps(5), 8);
    }

    #[test]
    fn preset_detection_ignores_case() {
        assert_eq!(StylePreset::detect("sunset, ANIME"), Some(StylePreset::Anime));
        assert_eq!(StylePreset::detect("some digital art"), Some(StylePreset::DigitalArt));
        assert_eq!(StylePreset::detect("a plain cat"), None);
        assert_eq!(
            StylePreset::detect("abstract photorealistic"),
            Some(StylePreset::Photorealistic)
        );
    }

    #[test]
    fn preset_applies_once() {
        let mut prompt = "sunset, Anime".to_string();
        assert_eq!(apply_style_preset(&mut prompt), Some(StylePreset::Anime));
        let once = prompt.clone();
        assert_eq!(
            once,
            "sunset, Anime, anime style, vibrant colors, detailed illustration"
        );
        apply_style_preset(&mut prompt);
        assert_eq!(prompt, once);

        let mut plain = "a cat".to_string();
        assert_eq!(apply_style_preset(&mut plain), None);
        assert_eq!(plain, "a cat");
    }

    #[test]
    fn quick_insert() {
        assert_eq!(StylePreset::Abstract.insert_into(""), StylePreset::Abstract.descriptor());
        assert_eq!(
            StylePreset::Photorealistic.insert_into("a car"),
            "a car, photorealistic, highly detailed, 8k uhd"
        );
    }

    #[test]
    fn sizes_parse() {
        assert_eq!("768x768".parse::<ImageSize>(), Ok(ImageSize::S768));
        assert_eq!(ImageSize::S256.to_string(), "256x256");
        assert!("1024x1024".parse::<ImageSize>().is_err());
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            quality: 5,
            size: ImageSize::S512,
            guidance_scale: 1.0,
            seed: -1,
            batch_count: 1,
        }
    }

    #[test]
    fn validation() {
        assert!(request("a cat").validate().is_ok());
        assert!(matches!(
            request("  \n\t").validate(),
            Err(ImagenError::InvalidRequest(_))
        ));
        let mut r = request("a cat");
        r.guidance_scale = 2.5;
        assert!(r.validate().is_err());
        let mut r = request("a cat");
        r.batch_count = 5;
        assert!(r.validate().is_err());
        let mut r = request("a cat");
        r.seed = -2;
        assert!(r.validate().is_err());
    }

    #[test]
    fn seeds() {
        assert_eq!(request("x").fixed_seed(), None);
        let mut r = request("x");
        r.seed = 42;
        assert_eq!(r.fixed_seed(), Some(42));
    }
}
