use std::{
    fmt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use candle_core::{utils::cuda_is_available, DType, Device, Tensor};
use image::{DynamicImage, ImageBuffer};
use tracing::info;

/// Where the model runs, decided once when it is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Cpu,
    Cuda(usize),
}

impl ExecutionTarget {
    pub fn detect(force_cpu: bool) -> Self {
        if force_cpu {
            Self::Cpu
        } else if cuda_is_available() {
            Self::Cuda(0)
        } else {
            info!("Running on CPU, to run on GPU, build with `--features cuda`");
            Self::Cpu
        }
    }

    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    pub fn device(&self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Ok(Device::new_cuda(*ordinal)?),
        }
    }

    /// Half precision on accelerators, full precision on CPU.
    pub fn dtype(&self) -> DType {
        if self.is_accelerated() {
            DType::F16
        } else {
            DType::F32
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        anyhow::bail!("tensor_to_image expects an input of shape (3, height, width)");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let image: ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(image))
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `<dir>/generated_<timestamp>_<index>.png`
pub fn output_filename(dir: &Path, timestamp: u64, index: usize) -> PathBuf {
    dir.join(format!("generated_{timestamp}_{index}.png"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_filename_is_keyed_by_time_and_index() {
        let path = output_filename(Path::new("output"), 1_700_000_000, 2);
        assert_eq!(path, PathBuf::from("output/generated_1700000000_2.png"));
    }

    #[test]
    fn forced_cpu_runs_in_full_precision() {
        let target = ExecutionTarget::detect(true);
        assert_eq!(target, ExecutionTarget::Cpu);
        assert!(!target.is_accelerated());
        assert_eq!(target.dtype(), DType::F32);
        assert!(target.device().unwrap().is_cpu());
        assert_eq!(ExecutionTarget::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn tensor_to_image_keeps_pixels() {
        let data: Vec<u8> = vec![255, 0, 10, 20, 0, 255, 30, 40, 7, 7, 7, 7];
        let tensor = Tensor::from_vec(data, (3, 2, 2), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 7]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 255, 7]);
    }

    #[test]
    fn tensor_to_image_rejects_grayscale() {
        let tensor = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
