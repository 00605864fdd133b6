//! Exponential moving average of model weights
//!
//! The shadow model starts as a copy of the live model and after every
//! optimizer step moves towards it: `shadow = d * shadow + (1 - d) * live`.

use anyhow::{anyhow, Result};
use candle_core::Var;
use candle_nn::VarMap;

use crate::model::UdModel;

fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock poisoned"))?;
    let mut vars: Vec<_> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Pairs every shadow variable with its live counterpart
pub struct ExponentialMovingAverage {
    decay: f64,
    pairs: Vec<(Var, Var)>,
}

impl ExponentialMovingAverage {
    /// Track `live` in `shadow`, which must have the same variables
    pub fn new(shadow: &UdModel, live: &UdModel, decay: f64) -> Result<Self> {
        Self::from_varmaps(shadow.varmap(), live.varmap(), decay)
    }

    /// Track the variables of `live` in the same-named variables of `shadow`
    pub fn from_varmaps(shadow: &VarMap, live: &VarMap, decay: f64) -> Result<Self> {
        let shadow_vars = sorted_vars(shadow)?;
        let live_vars = sorted_vars(live)?;
        if shadow_vars.len() != live_vars.len() {
            return Err(anyhow!(
                "shadow has {} variables, live model has {}",
                shadow_vars.len(),
                live_vars.len()
            ));
        }
        let pairs = shadow_vars
            .into_iter()
            .zip(live_vars)
            .map(|((shadow_name, shadow_var), (live_name, live_var))| {
                if shadow_name != live_name {
                    return Err(anyhow!("variable {} has no counterpart {}", shadow_name, live_name));
                }
                Ok((shadow_var, live_var))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { decay, pairs })
    }

    /// Decay factor
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Move every shadow variable towards the live one
    pub fn update(&self) -> Result<()> {
        for (shadow, live) in &self.pairs {
            let blended = ((shadow.as_tensor().detach() * self.decay)?
                + (live.as_tensor().detach() * (1.0 - self.decay))?)?;
            shadow.set(&blended)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    fn varmap(value: f32) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(3, "w", candle_nn::init::ZERO).unwrap();
        drop(w);
        let data = varmap.data().lock().unwrap();
        data["w"].set(&Tensor::full(value, 3, &Device::Cpu).unwrap()).unwrap();
        drop(data);
        varmap
    }

    #[test]
    fn test_update_formula() {
        let shadow = varmap(1.0);
        let live = varmap(3.0);
        let ema = ExponentialMovingAverage::from_varmaps(&shadow, &live, 0.9).unwrap();
        ema.update().unwrap();

        let data = shadow.data().lock().unwrap();
        for value in data["w"].as_tensor().to_vec1::<f32>().unwrap() {
            assert_relative_eq!(value, 0.9 * 1.0 + 0.1 * 3.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_mismatched_models_rejected() {
        let shadow = varmap(1.0);
        let live = VarMap::new();
        assert!(ExponentialMovingAverage::from_varmaps(&shadow, &live, 0.9).is_err());
    }
}
