//! AdamW optimizer implementation
//!
//! Decoupled weight decay over independent parameter groups, with global
//! gradient-norm clipping applied across all groups before the update.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use super::{Optimizer, ParamGroup, StepStats};

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Parameter groups with their base learning rates and decay
    groups: Vec<ParamGroup>,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Global gradient norm ceiling
    max_grad_norm: Option<f64>,

    /// Schedule factor applied to every base learning rate
    lr_factor: f64,

    /// Current step count
    step_count: usize,

    /// First and second moment estimates by parameter name
    moments: HashMap<String, (Tensor, Tensor)>,
}

impl AdamWOptimizer {
    /// Create a new AdamW optimizer
    pub fn new(groups: Vec<ParamGroup>, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            groups,
            beta1,
            beta2,
            epsilon,
            max_grad_norm: None,
            lr_factor: 1.0,
            step_count: 0,
            moments: HashMap::new(),
        }
    }

    /// Clip the global gradient norm to `max_norm` before every update
    pub fn with_max_grad_norm(mut self, max_norm: f64) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    /// Parameter groups
    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Current learning rate of every group
    pub fn group_learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.base_lr * self.lr_factor).collect()
    }

    fn vars(&self) -> impl Iterator<Item = &(String, Var)> {
        self.groups.iter().flat_map(|g| g.params.iter())
    }

    /// L2 norm over every available gradient
    fn global_norm(&self, gradients: &GradStore) -> Result<f64> {
        let mut total = 0.0;
        for (_, var) in self.vars() {
            if let Some(grad) = gradients.get(var.as_tensor()) {
                total += grad
                    .to_dtype(DType::F64)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f64>()?;
            }
        }
        Ok(total.sqrt())
    }

    fn update_parameter(
        &mut self,
        name: &str,
        var: &Var,
        grad: &Tensor,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<()> {
        let param = var.as_tensor().detach();
        let (momentum, variance) = match self.moments.remove(name) {
            Some(state) => state,
            None => (param.zeros_like()?, param.zeros_like()?),
        };

        // Decoupled decay: θ ← θ (1 - α λ)
        let param = if weight_decay > 0.0 {
            (&param * (1.0 - learning_rate * weight_decay))?
        } else {
            param
        };

        let momentum = ((momentum * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
        let variance = ((variance * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let denominator = ((variance.sqrt()? / bias_correction2.sqrt())? + self.epsilon)?;
        let update = (momentum.div(&denominator)? * (learning_rate / bias_correction1))?;
        var.set(&(param - update)?)?;

        self.moments.insert(name.to_string(), (momentum, variance));
        Ok(())
    }
}

impl Optimizer for AdamWOptimizer {
    fn name(&self) -> &str {
        "adamw"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<StepStats> {
        self.step_count += 1;

        let grad_norm = self.global_norm(gradients)?;
        let clip = match self.max_grad_norm {
            Some(max_norm) => (max_norm / (grad_norm + 1e-6)).min(1.0),
            None => 1.0,
        };

        let updates: Vec<(String, Var, Tensor, f64, f64)> = self
            .groups
            .iter()
            .flat_map(|group| {
                let lr = group.base_lr * self.lr_factor;
                let decay = group.weight_decay;
                group.params.iter().filter_map(move |(name, var)| {
                    gradients
                        .get(var.as_tensor())
                        .map(|grad| (name.clone(), var.clone(), grad.clone(), lr, decay))
                })
            })
            .collect();

        for (name, var, grad, lr, decay) in updates {
            let grad = if clip < 1.0 { (grad * clip)? } else { grad };
            self.update_parameter(&name, &var, &grad, lr, decay)?;
        }

        Ok(StepStats {
            grad_norm,
            learning_rate: self.learning_rate(),
        })
    }

    fn learning_rate(&self) -> f64 {
        self.groups.first().map_or(0.0, |g| g.base_lr * self.lr_factor)
    }

    fn set_lr_factor(&mut self, factor: f64) {
        self.lr_factor = factor;
    }

    fn parameter_count(&self) -> usize {
        self.vars().map(|(_, var)| var.elem_count()).sum()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
