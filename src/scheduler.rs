//! Latent consistency sampling.
//!
//! candle ships DDIM for the Stable Diffusion family but nothing for
//! consistency-distilled checkpoints, so the multistep LCM update lives here.
//! Which one runs is decided by the `_class_name` of the checkpoint's
//! `scheduler/scheduler_config.json`.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::Deserialize;

const SIGMA_DATA: f64 = 0.5;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(rename = "_class_name")]
    pub class_name: String,
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_original_inference_steps")]
    pub original_inference_steps: usize,
    #[serde(default = "default_timestep_scaling")]
    pub timestep_scaling: f64,
    #[serde(default = "default_set_alpha_to_one")]
    pub set_alpha_to_one: bool,
}

fn default_train_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    0.00085
}
fn default_beta_end() -> f64 {
    0.012
}
fn default_original_inference_steps() -> usize {
    50
}
fn default_timestep_scaling() -> f64 {
    10.0
}
fn default_set_alpha_to_one() -> bool {
    true
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn is_lcm(&self) -> bool {
        self.class_name == "LCMScheduler"
    }
}

/// Multistep latent consistency scheduler for one generation.
#[derive(Debug, Clone)]
pub struct LcmScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timestep_scaling: f64,
}

impl LcmScheduler {
    pub fn new(config: &SchedulerConfig, steps: usize) -> Result<Self> {
        let original = config.original_inference_steps;
        if steps == 0 || steps > original {
            anyhow::bail!("LCM sampling needs between 1 and {original} steps, got {steps}");
        }

        // scaled_linear betas
        let n = config.num_train_timesteps;
        let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for i in 0..n {
            let frac = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            let beta = (start + (end - start) * frac).powi(2);
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        // Skip through the distillation schedule from the noisiest end.
        let k = n / original;
        let origin: Vec<usize> = (1..=original).map(|i| i * k - 1).rev().collect();
        let skipping_step = (origin.len() / steps).max(1);
        let timesteps = origin
            .into_iter()
            .step_by(skipping_step)
            .take(steps)
            .collect();

        Ok(Self {
            timesteps,
            alphas_cumprod,
            final_alpha_cumprod,
            timestep_scaling: config.timestep_scaling,
        })
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn is_final(&self, step_index: usize) -> bool {
        step_index + 1 >= self.timesteps.len()
    }

    /// `(c_skip, c_out)` consistency boundary terms at `timestep`.
    pub fn boundary_scalings(&self, timestep: usize) -> (f64, f64) {
        let scaled = timestep as f64 * self.timestep_scaling;
        let denom = scaled * scaled + SIGMA_DATA * SIGMA_DATA;
        (SIGMA_DATA * SIGMA_DATA / denom, scaled / denom.sqrt())
    }

    fn alpha_prev(&self, step_index: usize) -> f64 {
        match self.timesteps.get(step_index + 1) {
            Some(&prev) => self.alphas_cumprod[prev],
            None => self.final_alpha_cumprod,
        }
    }

    /// Consistency estimate of the clean latents from an epsilon prediction.
    pub fn denoise(&self, noise_pred: &Tensor, step_index: usize, sample: &Tensor) -> Result<Tensor> {
        let timestep = self.timesteps[step_index];
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let beta_prod_t = 1.0 - alpha_prod_t;
        let predicted_original =
            (sample - noise_pred.affine(beta_prod_t.sqrt(), 0.)?)?.affine(1. / alpha_prod_t.sqrt(), 0.)?;
        let (c_skip, c_out) = self.boundary_scalings(timestep);
        Ok((predicted_original.affine(c_out, 0.)? + sample.affine(c_skip, 0.)?)?)
    }

    /// Noises `denoised` back up to the next timestep of the schedule.
    pub fn renoise(&self, denoised: &Tensor, step_index: usize, noise: &Tensor) -> Result<Tensor> {
        let alpha_prev = self.alpha_prev(step_index);
        Ok((denoised.affine(alpha_prev.sqrt(), 0.)? + noise.affine((1.0 - alpha_prev).sqrt(), 0.)?)?)
    }
}
