//! Sparse optimizers applied on the ps side.
//!
//! Each optimizer updates the weight of one feature id with its aggregated gradient and the
//! optimizer state stored next to the weight. The state is created lazily when an id receives its
//! first gradient, ids that are only looked up never carry state.
//!
//! Optimizers are created by name from `OptimizerOption`, see `create_optimizer`.

use anyhow::{bail, Result};
use log::error;

use grpc::embedding::OptimizerOption;
use util::vector::axpy;
use util::{error_bail, EmbeddingError};

/// Per id optimizer state.
///
/// Layout of `values` is decided by the optimizer, `step` counts the updates applied to the id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OptimizerState {
    pub values: Vec<f32>,
    pub step: u64,
}

pub trait SparseOptimizer: Send + Sync {
    /// Registry name, lower case.
    fn name(&self) -> &'static str;

    /// Floats of state for each id.
    fn state_dim(&self, embedding_size: usize) -> usize;

    fn init_state(&self, embedding_size: usize) -> OptimizerState {
        OptimizerState {
            values: vec![0.0; self.state_dim(embedding_size)],
            step: 0,
        }
    }

    /// Apply `grad` to `weight` in place, `state.step` is increased by one.
    fn apply(&self, weight: &mut [f32], state: &mut OptimizerState, grad: &[f32]) -> Result<()>;
}

fn check_len(weight: &[f32], state: &OptimizerState, grad: &[f32], state_dim: usize) -> Result<()> {
    if weight.len() != grad.len() {
        return Err(EmbeddingError::dimension_mismatch(weight.len(), grad.len()).into());
    }

    if state.values.len() != state_dim {
        return Err(EmbeddingError::dimension_mismatch(state_dim, state.values.len()).into());
    }

    Ok(())
}

/// `w -= lr * g`.
#[derive(Clone, Debug)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl SparseOptimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn state_dim(&self, _embedding_size: usize) -> usize {
        0
    }

    fn apply(&self, weight: &mut [f32], state: &mut OptimizerState, grad: &[f32]) -> Result<()> {
        check_len(weight, state, grad, 0)?;
        axpy(weight, -self.learning_rate, grad)?;

        state.step += 1;

        Ok(())
    }
}

/// Adagrad.
///
/// `acc += g * g; w -= lr * g / (sqrt(acc) + eps)`.
///
/// Reference: https://pytorch.org/docs/stable/generated/torch.optim.Adagrad.html
#[derive(Clone, Debug)]
pub struct Adagrad {
    pub learning_rate: f32,
    pub epsilon: f32,
    pub initial_accumulator: f32,
}

impl SparseOptimizer for Adagrad {
    fn name(&self) -> &'static str {
        "adagrad"
    }

    fn state_dim(&self, embedding_size: usize) -> usize {
        embedding_size
    }

    fn init_state(&self, embedding_size: usize) -> OptimizerState {
        OptimizerState {
            values: vec![self.initial_accumulator; embedding_size],
            step: 0,
        }
    }

    fn apply(&self, weight: &mut [f32], state: &mut OptimizerState, grad: &[f32]) -> Result<()> {
        check_len(weight, state, grad, weight.len())?;

        for ((w, acc), g) in weight.iter_mut().zip(state.values.iter_mut()).zip(grad) {
            *acc += g * g;
            *w -= self.learning_rate * g / (acc.sqrt() + self.epsilon);
        }

        state.step += 1;

        Ok(())
    }
}

/// Adam with bias correction by the step of each id.
///
/// State layout is `[m; embedding_size]` followed by `[v; embedding_size]`.
#[derive(Clone, Debug)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl SparseOptimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn state_dim(&self, embedding_size: usize) -> usize {
        embedding_size * 2
    }

    fn apply(&self, weight: &mut [f32], state: &mut OptimizerState, grad: &[f32]) -> Result<()> {
        let dim = weight.len();
        check_len(weight, state, grad, dim * 2)?;

        state.step += 1;

        let t = state.step.min(i32::MAX as u64) as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        let (m, v) = state.values.split_at_mut(dim);

        for i in 0..dim {
            let g = grad[i];

            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = m[i] / bias1;
            let v_hat = v[i] / bias2;

            weight[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }

        Ok(())
    }
}

pub const DEFAULT_BETA1: f32 = 0.9;
pub const DEFAULT_BETA2: f32 = 0.999;
pub const DEFAULT_EPSILON: f32 = 1e-8;

/// Zero in proto means the field is not set.
#[inline]
fn or_default(value: f32, default: f32) -> f32 {
    if value == 0.0 {
        default
    } else {
        value
    }
}

fn check_learning_rate(option: &OptimizerOption) -> Result<()> {
    if !(option.learning_rate > 0.0) || !option.learning_rate.is_finite() {
        return Err(EmbeddingError::invalid_config(format!(
            "learning_rate must be positive, optimizer: {}, learning_rate: {}",
            option.name, option.learning_rate
        ))
        .into());
    }

    Ok(())
}

fn check_beta(name: &str, beta: f32) -> Result<()> {
    if !(0.0..1.0).contains(&beta) {
        return Err(EmbeddingError::invalid_config(format!(
            "{} must be in [0, 1), value: {}",
            name, beta
        ))
        .into());
    }

    Ok(())
}

fn build_sgd(option: &OptimizerOption) -> Result<Box<dyn SparseOptimizer>> {
    check_learning_rate(option)?;

    Ok(Box::new(Sgd {
        learning_rate: option.learning_rate,
    }))
}

fn build_adagrad(option: &OptimizerOption) -> Result<Box<dyn SparseOptimizer>> {
    check_learning_rate(option)?;

    if option.initial_accumulator < 0.0 {
        error_bail!(
            "initial_accumulator must not be negative, value: {}",
            option.initial_accumulator,
        );
    }

    Ok(Box::new(Adagrad {
        learning_rate: option.learning_rate,
        epsilon: or_default(option.epsilon, DEFAULT_EPSILON),
        initial_accumulator: option.initial_accumulator,
    }))
}

fn build_adam(option: &OptimizerOption) -> Result<Box<dyn SparseOptimizer>> {
    check_learning_rate(option)?;

    let beta1 = or_default(option.beta1, DEFAULT_BETA1);
    let beta2 = or_default(option.beta2, DEFAULT_BETA2);

    check_beta("beta1", beta1)?;
    check_beta("beta2", beta2)?;

    Ok(Box::new(Adam {
        learning_rate: option.learning_rate,
        beta1,
        beta2,
        epsilon: or_default(option.epsilon, DEFAULT_EPSILON),
    }))
}

type OptimizerBuilder = fn(&OptimizerOption) -> Result<Box<dyn SparseOptimizer>>;

/// Registered optimizers.
const OPTIMIZERS: &[(&str, OptimizerBuilder)] = &[
    ("sgd", build_sgd),
    ("adagrad", build_adagrad),
    ("adam", build_adam),
];

/// Names of all registered optimizers.
pub fn optimizer_names() -> Vec<&'static str> {
    OPTIMIZERS.iter().map(|(name, _)| *name).collect()
}

/// Create optimizer by case-insensitive name, hyper-parameters are validated here.
pub fn create_optimizer(option: &OptimizerOption) -> Result<Box<dyn SparseOptimizer>> {
    let name = option.name.trim().to_lowercase();

    match OPTIMIZERS.iter().find(|(x, _)| *x == name) {
        Some((_, builder)) => builder(option),
        None => {
            error!(
                "unknown optimizer: {}, supported: {:?}",
                option.name,
                optimizer_names()
            );
            Err(EmbeddingError::UnknownOptimizer(option.name.clone()).into())
        }
    }
}
