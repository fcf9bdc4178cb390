use candle_core::Device;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_MODEL_ID: &str = "openai-community/gpt2";
pub const DEFAULT_PROMPT: &str = "In order to make an omelette";
pub const DEFAULT_LENGTH: usize = 100;
pub const DEFAULT_TEMPERATURES: [f64; 7] = [0.001, 0.01, 0.1, 0.2, 0.3, 1.0, 5.0];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("temperature must be finite and positive, got {0}")]
    InvalidTemperature(f64),
    #[error("decoding length must be at least one step")]
    ZeroLength,
    #[error("device {device:?} is unavailable: {source}")]
    DeviceUnavailable {
        device: WhichDevice,
        source: candle_core::Error,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WhichDevice {
    #[default]
    #[value(name = "cpu")]
    Cpu,

    #[value(name = "cuda")]
    Cuda,

    #[value(name = "metal")]
    Metal,
}

impl WhichDevice {
    pub fn device(&self) -> Result<Device, ConfigError> {
        let device = match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Device::new_cuda(0),
            Self::Metal => Device::new_metal(0),
        };
        device.map_err(|source| ConfigError::DeviceUnavailable {
            device: *self,
            source,
        })
    }
}

/// Whether the decoding loop threads the key-value cache between steps or
/// re-encodes the whole sequence every step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Reuse,
    Recompute,
}

impl CacheMode {
    pub fn from_no_cache(no_cache: bool) -> Self {
        if no_cache {
            Self::Recompute
        } else {
            Self::Reuse
        }
    }
}

pub fn validate_temperature(temperature: f64) -> Result<f64, ConfigError> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(temperature)
    } else {
        Err(ConfigError::InvalidTemperature(temperature))
    }
}

/// Everything needed to bring a model up once and share it across experiments.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Hugging Face repo, used when `checkpoint` is not set
    pub model_id: String,
    /// Local directory with `config.json`, `model.safetensors` and `tokenizer.json`
    pub checkpoint: Option<PathBuf>,
    pub device: WhichDevice,
    pub prompt: String,
    pub length: usize,
    pub cache: CacheMode,
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            checkpoint: None,
            device: WhichDevice::Cpu,
            prompt: DEFAULT_PROMPT.to_string(),
            length: DEFAULT_LENGTH,
            cache: CacheMode::Reuse,
            show_progress: false,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.length == 0 {
            return Err(ConfigError::ZeroLength);
        }
        Ok(())
    }
}
