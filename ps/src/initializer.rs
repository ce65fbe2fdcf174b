//! Initializers of embedding vectors.
//!
//! A vector is created the first time its id is read or updated. With a seed, the vector of id `k`
//! only depends on `(seed, k, embedding_size)`, so it is the same no matter which worker touches
//! the id first.

use anyhow::{bail, Result};
use log::error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use grpc::embedding::{InitializerOption, InitializerType};
use util::{error_bail, mix_seed, EmbeddingError};

/// Distribution of initial values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InitializerKind {
    Constant(f32),
    Uniform { min: f32, max: f32 },
    Normal { mean: f32, stddev: f32 },
}

#[derive(Clone, Debug)]
pub struct EmbeddingInitializer {
    kind: InitializerKind,
    seed: Option<u64>,
}

impl Default for EmbeddingInitializer {
    fn default() -> Self {
        Self {
            kind: InitializerKind::Uniform {
                min: -0.05,
                max: 0.05,
            },
            seed: None,
        }
    }
}

impl EmbeddingInitializer {
    pub fn new(kind: InitializerKind, seed: Option<u64>) -> Result<Self> {
        match kind {
            InitializerKind::Constant(value) => {
                if !value.is_finite() {
                    return Err(EmbeddingError::invalid_config(format!(
                        "constant initializer value must be finite, value: {}",
                        value
                    ))
                    .into());
                }
            }
            InitializerKind::Uniform { min, max } => {
                if !(min < max) {
                    return Err(EmbeddingError::invalid_config(format!(
                        "uniform initializer needs min < max, min: {}, max: {}",
                        min, max
                    ))
                    .into());
                }
            }
            InitializerKind::Normal { mean, stddev } => {
                if !mean.is_finite() || !(stddev > 0.0) {
                    return Err(EmbeddingError::invalid_config(format!(
                        "normal initializer needs stddev > 0, mean: {}, stddev: {}",
                        mean, stddev
                    ))
                    .into());
                }
            }
        }

        Ok(Self { kind, seed })
    }

    /// Build initializer from request option, default one is used when option is missing.
    pub fn from_option(option: Option<&InitializerOption>) -> Result<Self> {
        let option = match option {
            Some(x) => x,
            None => return Ok(Self::default()),
        };

        let kind = match InitializerType::try_from(option.r#type) {
            Ok(InitializerType::InitConstant) => InitializerKind::Constant(option.value),
            Ok(InitializerType::InitUniform) => InitializerKind::Uniform {
                min: option.min,
                max: option.max,
            },
            Ok(InitializerType::InitNormal) => InitializerKind::Normal {
                mean: option.mean,
                stddev: option.stddev,
            },
            Err(_) => {
                error_bail!("unknown initializer type: {}", option.r#type);
            }
        };

        Self::new(kind, option.seed)
    }

    #[inline]
    pub fn kind(&self) -> InitializerKind {
        self.kind
    }

    /// Initial vector of `sign`.
    pub fn init(&self, sign: u64, embedding_size: usize) -> Vec<f32> {
        match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(mix_seed(seed, sign));
                self.fill(&mut rng, embedding_size)
            }
            None => self.fill(&mut rand::thread_rng(), embedding_size),
        }
    }

    fn fill<R: Rng>(&self, rng: &mut R, embedding_size: usize) -> Vec<f32> {
        match self.kind {
            InitializerKind::Constant(value) => vec![value; embedding_size],
            InitializerKind::Uniform { min, max } => {
                (0..embedding_size).map(|_| rng.gen_range(min..max)).collect()
            }
            InitializerKind::Normal { mean, stddev } => match Normal::new(mean, stddev) {
                Ok(normal) => (0..embedding_size).map(|_| normal.sample(rng)).collect(),
                // Checked in `new`.
                Err(_) => vec![mean; embedding_size],
            },
        }
    }
}
