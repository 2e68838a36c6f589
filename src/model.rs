use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use clap::ValueEnum;
use hf_hub::api::tokio::Api;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

impl StableDiffusionVersion {
    /// Hub repository the diffusers-format weights are fetched from.
    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "SimianLuo/LCM_Dreamshaper_v7",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    /// The diffusers checkpoints only ship the slow vocab/merges tokenizer
    /// files, the fast tokenizer JSON comes from the matching CLIP repo.
    pub fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 | Self::V2_1 => "openai/clip-vit-base-patch32",
        }
    }

    pub fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    Index,
    SchedulerConfig,
    ClipConfig,
    Vocab,
    UnetConfig,
    VaeConfig,
    Tokenizer,
    Clip,
    Unet,
    Vae,
}

impl ModelFile {
    pub const ALL: [ModelFile; 10] = [
        Self::Index,
        Self::SchedulerConfig,
        Self::ClipConfig,
        Self::Vocab,
        Self::UnetConfig,
        Self::VaeConfig,
        Self::Tokenizer,
        Self::Clip,
        Self::Unet,
        Self::Vae,
    ];

    /// Location relative to the model root.
    pub fn relative_path(&self) -> &'static str {
        match self {
            Self::Index => "model_index.json",
            Self::SchedulerConfig => "scheduler/scheduler_config.json",
            Self::ClipConfig => "text_encoder/config.json",
            Self::Vocab => "tokenizer/vocab.json",
            Self::UnetConfig => "unet/config.json",
            Self::VaeConfig => "vae/config.json",
            Self::Tokenizer => "tokenizer/tokenizer.json",
            Self::Clip => "text_encoder/model.safetensors",
            Self::Unet => "unet/diffusion_pytorch_model.safetensors",
            Self::Vae => "vae/diffusion_pytorch_model.safetensors",
        }
    }

    /// Repository and remote path this file is downloaded from.
    pub fn source(&self, version: StableDiffusionVersion, repo: &str) -> (String, &'static str) {
        match self {
            Self::Tokenizer => (version.tokenizer_repo().to_string(), "tokenizer.json"),
            _ => (repo.to_string(), self.relative_path()),
        }
    }

    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }
}

/// Outcome of checking the model root for every required file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactReport {
    pub missing: Vec<&'static str>,
}

impl ArtifactReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub fn verify_artifacts(root: &Path) -> ArtifactReport {
    debug!("verifying model files under {}", root.display());
    let mut report = ArtifactReport::default();
    for file in ModelFile::ALL {
        let exists = file.path_in(root).is_file();
        debug!("checking {}: {}", file.relative_path(), if exists { "✓" } else { "✗" });
        if !exists {
            error!("missing required file: {}", file.relative_path());
            report.missing.push(file.relative_path());
        }
    }
    report
}

/// Pulls every required file into `root`, skipping the ones already present.
pub async fn fetch_artifacts(
    root: &Path,
    version: StableDiffusionVersion,
    repo: Option<&str>,
) -> Result<()> {
    let repo = repo.unwrap_or(version.repo());
    info!("model will be saved to {}", root.display());
    let api = Api::new()?;
    for file in ModelFile::ALL {
        let target = file.path_in(root);
        if target.is_file() {
            debug!("{} already present", file.relative_path());
            continue;
        }
        let (repo, remote) = file.source(version, repo);
        info!("downloading {remote} from {repo}");
        let cached = api
            .model(repo.clone())
            .get(remote)
            .await
            .with_context(|| format!("failed to download {remote} from {repo}"))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&cached, &target)
            .await
            .with_context(|| format!("failed to copy {} into place", cached.display()))?;
    }
    info!("model downloaded and saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_reports_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let report = verify_artifacts(dir.path());
        assert!(!report.is_complete());
        assert_eq!(report.missing.len(), ModelFile::ALL.len());
        assert_eq!(report.missing[0], "model_index.json");
    }

    #[test]
    fn complete_root_passes() {
        let dir = tempfile::tempdir().unwrap();
        for file in ModelFile::ALL {
            let path = file.path_in(dir.path());
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"{}").unwrap();
        }
        assert!(verify_artifacts(dir.path()).is_complete());

        std::fs::remove_file(ModelFile::UnetConfig.path_in(dir.path())).unwrap();
        let report = verify_artifacts(dir.path());
        assert_eq!(report.missing, vec!["unet/config.json"]);
    }

    #[test]
    fn tokenizer_json_comes_from_clip_repo() {
        let (repo, remote) =
            ModelFile::Tokenizer.source(StableDiffusionVersion::V1_5, "some/checkpoint");
        assert_eq!(repo, "openai/clip-vit-base-patch32");
        assert_eq!(remote, "tokenizer.json");

        let (repo, remote) = ModelFile::Unet.source(StableDiffusionVersion::V1_5, "some/checkpoint");
        assert_eq!(repo, "some/checkpoint");
        assert_eq!(remote, "unet/diffusion_pytorch_model.safetensors");
    }
}
