//! Optimizers and learning rate schedulers for UD training
//!
//! Parameters are split into four groups along two axes: encoder or task
//! head, and whether the parameter kind is exempt from weight decay. The
//! encoder groups train at a fraction of the head learning rate.

pub mod adamw;
pub mod schedulers;

pub use adamw::AdamWOptimizer;
pub use schedulers::CosineScheduler;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{no_decay, ParamDescriptor, ParamOwner};
use crate::training::config::{OptimizerConfig, SchedulerConfig};

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Clip, update every parameter that has a gradient, and report the
    /// pre-clip gradient norm
    fn step(&mut self, gradients: &GradStore) -> Result<StepStats>;

    /// Current learning rate of the first group
    fn learning_rate(&self) -> f64;

    /// Set the schedule factor applied to every group's base learning rate
    fn set_lr_factor(&mut self, factor: f64);

    /// Get parameter count
    fn parameter_count(&self) -> usize;

    /// Get current step count
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance one step
    fn step(&mut self);

    /// Factor for the current step
    fn factor(&self) -> f64;

    /// Steps taken so far
    fn current_step(&self) -> usize;

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Outcome of one optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    /// Learning rate of the first group during the step
    pub learning_rate: f64,
}

/// Named parameters sharing a learning rate and weight decay
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Group name
    pub name: String,
    /// Parameters by variable name
    pub params: Vec<(String, Var)>,
    /// Learning rate before scheduling
    pub base_lr: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
}

/// Split parameters into encoder/head × decay/no-decay groups
pub fn build_param_groups(params: Vec<(ParamDescriptor, Var)>, config: &OptimizerConfig) -> Vec<ParamGroup> {
    let encoder_lr = config.encoder_lr_multiplier * config.learning_rate;
    let mut groups = vec![
        ParamGroup {
            name: "encoder_decay".to_string(),
            params: Vec::new(),
            base_lr: encoder_lr,
            weight_decay: config.encoder_weight_decay,
        },
        ParamGroup {
            name: "encoder_no_decay".to_string(),
            params: Vec::new(),
            base_lr: encoder_lr,
            weight_decay: 0.0,
        },
        ParamGroup {
            name: "head_decay".to_string(),
            params: Vec::new(),
            base_lr: config.learning_rate,
            weight_decay: config.weight_decay,
        },
        ParamGroup {
            name: "head_no_decay".to_string(),
            params: Vec::new(),
            base_lr: config.learning_rate,
            weight_decay: 0.0,
        },
    ];

    for (descriptor, var) in params {
        let slot = match (descriptor.owner, no_decay(&descriptor)) {
            (ParamOwner::Encoder, false) => 0,
            (ParamOwner::Encoder, true) => 1,
            (ParamOwner::Head, false) => 2,
            (ParamOwner::Head, true) => 3,
        };
        groups[slot].params.push((descriptor.name, var));
    }

    for group in &groups {
        debug!(
            "Parameter group {}: {} tensors, lr {:.2e}, weight decay {}",
            group.name,
            group.params.len(),
            group.base_lr,
            group.weight_decay
        );
    }
    groups
}

/// Create optimizer from configuration
pub fn create_optimizer(params: Vec<(ParamDescriptor, Var)>, config: &OptimizerConfig) -> AdamWOptimizer {
    AdamWOptimizer::new(
        build_param_groups(params, config),
        config.beta1,
        config.beta2,
        config.epsilon,
    )
    .with_max_grad_norm(config.max_grad_norm)
}

/// Create scheduler from configuration
pub fn create_scheduler(config: &SchedulerConfig, total_steps: usize) -> CosineScheduler {
    CosineScheduler::new(config.warmup_steps, total_steps, config.min_factor)
}
