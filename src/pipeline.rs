use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    manager::{ImageModel, Loader},
    model::{ModelFile, StableDiffusionVersion},
    scheduler::{LcmScheduler, SchedulerConfig},
    utils::{tensor_to_image, ExecutionTarget},
};

const VAE_SCALE: f64 = 0.18215;

/// Builds a [`StableDiffusion`] from a diffusers-format directory.
#[derive(Debug, Clone)]
pub struct StableDiffusionLoader {
    pub version: StableDiffusionVersion,
    /// The size of the sliced attention or 0 for automatic slicing.
    pub sliced_attention_size: Option<usize>,
    pub use_flash_attn: bool,
}

impl StableDiffusionLoader {
    pub fn new(version: StableDiffusionVersion) -> Self {
        Self {
            version,
            sliced_attention_size: None,
            use_flash_attn: false,
        }
    }
}

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusion;

    fn load(&self, root: &Path, target: ExecutionTarget) -> Result<StableDiffusion> {
        if self.use_flash_attn && !cfg!(feature = "flash-attn") {
            anyhow::bail!("flash attention needs a build with `--features flash-attn`");
        }
        let device = target.device()?;
        let dtype = target.dtype();
        let sd_config = self.version.config(self.sliced_attention_size);

        let scheduler_config = SchedulerConfig::from_file(&ModelFile::SchedulerConfig.path_in(root))?;
        info!("sampling with {}", scheduler_config.class_name);

        let tokenizer =
            Tokenizer::from_file(ModelFile::Tokenizer.path_in(root)).map_err(E::msg)?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| E::msg(format!("tokenizer has no {pad_token} token")))?;

        info!("building the clip transformer");
        let clip = build_clip_transformer(
            &sd_config.clip,
            ModelFile::Clip.path_in(root),
            &device,
            DType::F32,
        )?;

        info!("building the autoencoder");
        let vae = sd_config.build_vae(ModelFile::Vae.path_in(root), &device, dtype)?;

        info!("building the unet");
        let unet = sd_config.build_unet(
            ModelFile::Unet.path_in(root),
            &device,
            4,
            self.use_flash_attn,
            dtype,
        )?;

        Ok(StableDiffusion {
            device,
            dtype,
            sd_config,
            scheduler_config,
            tokenizer,
            pad_id,
            clip,
            vae,
            unet,
            rng: StdRng::from_entropy(),
        })
    }
}

/// Draws `4 * (height / 8) * (width / 8)` standard normal latent values.
pub fn latent_noise(rng: &mut StdRng, width: usize, height: usize) -> Vec<f32> {
    let len = 4 * (height / 8) * (width / 8);
    (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Cuts `ids` to `max_len` tokens, then pads with `pad_id` up to `max_len`.
pub fn pad_tokens(mut ids: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    ids.truncate(max_len);
    ids.resize(max_len, pad_id);
    ids
}

/// Classifier-free guidance: `uncond + scale * (text - uncond)`.
pub fn guide(noise_pred_uncond: &Tensor, noise_pred_text: &Tensor, scale: f64) -> Result<Tensor> {
    Ok((noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * scale)?)?)
}

pub fn check_size(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        anyhow::bail!("image size should be a non-zero multiple of 8, got {width}x{height}");
    }
    Ok(())
}

pub struct StableDiffusion {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    scheduler_config: SchedulerConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    // Noise is drawn on the host so seeding behaves the same on every device.
    rng: StdRng,
}

impl StableDiffusion {
    fn tokens(&self, prompt: &str) -> Result<Tensor> {
        let ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        let tokens = pad_tokens(ids, self.sd_config.clip.max_position_embeddings, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Conditional embeddings, preceded by the unconditional ones when
    /// guidance mixes the two predictions.
    fn text_embeddings(&self, prompt: &str, guided: bool) -> Result<Tensor> {
        let text_embeddings = self.clip.forward(&self.tokens(prompt)?)?;
        let text_embeddings = if guided {
            let uncond_embeddings = self.clip.forward(&self.tokens("")?)?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };
        Ok(text_embeddings.to_dtype(self.dtype)?)
    }

    fn noise(&mut self, width: usize, height: usize) -> Result<Tensor> {
        let noise = latent_noise(&mut self.rng, width, height);
        let latents = Tensor::from_vec(noise, (1, 4, height / 8, width / 8), &Device::Cpu)?
            .to_device(&self.device)?;
        Ok(latents.to_dtype(self.dtype)?)
    }

    /// Epsilon prediction, blended as `uncond + scale * (text - uncond)` when guided.
    fn predict_noise(
        &self,
        latent_model_input: Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
        guidance_scale: Option<f64>,
    ) -> Result<Tensor> {
        let latent_model_input = match guidance_scale {
            Some(_) => Tensor::cat(&[&latent_model_input, &latent_model_input], 0)?,
            None => latent_model_input,
        };
        let noise_pred = self
            .unet
            .forward(&latent_model_input, timestep as f64, text_embeddings)?;
        match guidance_scale {
            Some(scale) => {
                let noise_pred = noise_pred.chunk(2, 0)?;
                guide(&noise_pred[0], &noise_pred[1], scale)
            }
            None => Ok(noise_pred),
        }
    }

    fn sample_ddim(
        &mut self,
        steps: usize,
        text_embeddings: &Tensor,
        guidance: Option<f64>,
        width: usize,
        height: usize,
    ) -> Result<Tensor> {
        let scheduler = self.sd_config.build_scheduler(steps)?;
        // scale the initial noise by the standard deviation required by the scheduler
        let mut latents = (self.noise(width, height)? * scheduler.init_noise_sigma())?;
        for (timestep_index, &timestep) in scheduler.timesteps().iter().enumerate() {
            let start_time = std::time::Instant::now();
            let input = scheduler.scale_model_input(latents.clone(), timestep)?;
            let noise_pred = self.predict_noise(input, timestep, text_embeddings, guidance)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            let dt = start_time.elapsed().as_secs_f32();
            debug!("step {}/{steps} done, {dt:.2}s", timestep_index + 1);
        }
        Ok(latents)
    }

    fn sample_lcm(
        &mut self,
        steps: usize,
        text_embeddings: &Tensor,
        guidance: Option<f64>,
        width: usize,
        height: usize,
    ) -> Result<Tensor> {
        let scheduler = LcmScheduler::new(&self.scheduler_config, steps)?;
        let mut latents = self.noise(width, height)?;
        for (step_index, &timestep) in scheduler.timesteps().iter().enumerate() {
            let start_time = std::time::Instant::now();
            let noise_pred = self.predict_noise(latents.clone(), timestep, text_embeddings, guidance)?;
            let denoised = scheduler.denoise(&noise_pred, step_index, &latents)?;
            latents = if scheduler.is_final(step_index) {
                denoised
            } else {
                let noise = self.noise(width, height)?;
                scheduler.renoise(&denoised, step_index, &noise)?
            };
            let dt = start_time.elapsed().as_secs_f32();
            debug!("step {}/{steps} done, {dt:.2}s", step_index + 1);
        }
        Ok(latents)
    }
}

impl ImageModel for StableDiffusion {
    fn generate(
        &mut self,
        prompt: &str,
        steps: usize,
        guidance_scale: f64,
        width: usize,
        height: usize,
    ) -> Result<DynamicImage> {
        check_size(width, height)?;
        // A scale of exactly 1 reduces to the conditional prediction alone.
        let guidance = ((guidance_scale - 1.0).abs() > f64::EPSILON).then_some(guidance_scale);
        let text_embeddings = self.text_embeddings(prompt, guidance.is_some())?;

        let latents = if self.scheduler_config.is_lcm() {
            self.sample_lcm(steps, &text_embeddings, guidance, width, height)?
        } else {
            self.sample_ddim(steps, &text_embeddings, guidance, width, height)?
        };

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }

    fn set_seed(&mut self, seed: u64) -> Result<()> {
        self.rng = StdRng::seed_from_u64(seed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let a = latent_noise(&mut StdRng::seed_from_u64(42), 64, 64);
        let b = latent_noise(&mut StdRng::seed_from_u64(42), 64, 64);
        assert_eq!(a, b);
        let c = latent_noise(&mut StdRng::seed_from_u64(7), 64, 64);
        assert_ne!(a, c);
    }

    #[test]
    fn unseeded_noise_varies() {
        let a = latent_noise(&mut StdRng::from_entropy(), 64, 64);
        let b = latent_noise(&mut StdRng::from_entropy(), 64, 64);
        assert_ne!(a, b);
    }

    #[test]
    fn noise_fills_the_latent_grid() {
        let noise = latent_noise(&mut StdRng::seed_from_u64(1), 512, 256);
        assert_eq!(noise.len(), 4 * (256 / 8) * (512 / 8));
        let mean = noise.iter().sum::<f32>() / noise.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
    }

    #[test]
    fn reseeding_continues_from_the_seed() {
        let mut rng = StdRng::seed_from_u64(42);
        let first = latent_noise(&mut rng, 16, 16);
        let second = latent_noise(&mut rng, 16, 16);
        assert_ne!(first, second);
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(latent_noise(&mut rng, 16, 16), first);
    }

    #[test]
    fn short_prompts_are_padded() {
        assert_eq!(pad_tokens(vec![49406, 320, 49407], 6, 49407), vec![
            49406, 320, 49407, 49407, 49407, 49407
        ]);
    }

    #[test]
    fn long_prompts_are_truncated() {
        let ids: Vec<u32> = (0..120).collect();
        let tokens = pad_tokens(ids, 77, 0);
        assert_eq!(tokens.len(), 77);
        assert_eq!(tokens[76], 76);
    }

    #[test]
    fn guidance_below_one_leans_unconditional() {
        let uncond = Tensor::new(&[0.0f32, 2.0], &Device::Cpu).unwrap();
        let text = Tensor::new(&[1.0f32, 4.0], &Device::Cpu).unwrap();
        let blend = |scale| guide(&uncond, &text, scale).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(blend(0.5), vec![0.5, 3.0]);
        assert_eq!(blend(1.0), vec![1.0, 4.0]);
        assert_eq!(blend(2.0), vec![2.0, 6.0]);
    }

    #[test]
    fn size_must_be_a_multiple_of_eight() {
        assert!(check_size(512, 512).is_ok());
        assert!(check_size(256, 768).is_ok());
        assert!(check_size(500, 512).is_err());
        assert!(check_size(512, 0).is_err());
    }

    #[test]
    fn flash_attention_needs_the_feature() {
        if cfg!(feature = "flash-attn") {
            return;
        }
        let loader = StableDiffusionLoader {
            use_flash_attn: true,
            ..StableDiffusionLoader::new(StableDiffusionVersion::V1_5)
        };
        let dir = tempfile::tempdir().unwrap();
        let err = loader.load(dir.path(), ExecutionTarget::Cpu).err().unwrap();
        assert!(err.to_string().contains("flash-attn"));
    }
}
