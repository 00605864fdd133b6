//! BERT encoder backed by `candle-transformers`

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tracing::{debug, info};

use super::{Encoder, EncoderFactory};
use crate::error::{Error, Result};

/// BERT encoder over a [`VarBuilder`]
pub struct BertEncoder {
    model: BertModel,
    hidden_size: usize,
}

impl BertEncoder {
    /// Build the encoder's variables under `vb`
    pub fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let model = BertModel::load(vb, config)?;
        Ok(Self {
            model,
            hidden_size: config.hidden_size,
        })
    }
}

impl Encoder for BertEncoder {
    fn forward(&self, subwords: &Tensor, attention_mask: &Tensor, _train: bool) -> Result<Tensor> {
        let token_type_ids = subwords.zeros_like()?;
        Ok(self
            .model
            .forward(subwords, &token_type_ids, Some(attention_mask))?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// Parse a `config.json`, filling keys that older exports leave out
fn parse_config(content: &str) -> Result<BertConfig> {
    let mut value: serde_json::Value = serde_json::from_str(content)?;
    if let Some(object) = value.as_object_mut() {
        object
            .entry("pad_token_id")
            .or_insert(serde_json::Value::from(0));
    }
    Ok(serde_json::from_value(value)?)
}

/// Creates [`BertEncoder`]s from a snapshot's config and safetensors weights
#[derive(Debug, Clone)]
pub struct BertFactory {
    config: BertConfig,
    weights: Vec<PathBuf>,
    device: Device,
}

impl BertFactory {
    /// Read `config.json` and remember the weight files
    pub fn from_files(config: &Path, weights: Vec<PathBuf>, device: &Device) -> Result<Self> {
        let content = std::fs::read_to_string(config)?;
        let config = parse_config(&content)?;
        Ok(Self {
            config,
            weights,
            device: device.clone(),
        })
    }

    /// Encoder configuration
    pub fn config(&self) -> &BertConfig {
        &self.config
    }
}

impl EncoderFactory for BertFactory {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Encoder>> {
        Ok(Box::new(BertEncoder::load(vb, &self.config)?))
    }

    fn load_pretrained(&self, varmap: &VarMap, prefix: &str) -> Result<usize> {
        let mut pretrained = std::collections::HashMap::new();
        for path in &self.weights {
            debug!("Reading encoder weights from {}", path.display());
            pretrained.extend(candle_core::safetensors::load(path, &self.device)?);
        }

        let vars = varmap
            .data()
            .lock()
            .map_err(|_| Error::config("variable map lock poisoned"))?;
        let mut loaded = 0;
        let mut missing = Vec::new();
        for (name, var) in vars.iter() {
            let Some(key) = name.strip_prefix(prefix).map(|k| k.trim_start_matches('.')) else {
                continue;
            };
            let tensor = pretrained
                .get(key)
                .or_else(|| pretrained.get(&format!("bert.{}", key)));
            match tensor {
                Some(tensor) if tensor.dims() == var.dims() => {
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                    loaded += 1;
                }
                Some(tensor) => {
                    return Err(Error::config(format!(
                        "pretrained weight {} has shape {:?}, expected {:?}",
                        key,
                        tensor.dims(),
                        var.dims()
                    )))
                }
                None => missing.push(key.to_string()),
            }
        }

        if !missing.is_empty() {
            missing.sort();
            return Err(Error::config(format!(
                "{} of {} encoder variables have no pretrained tensor, e.g. {}",
                missing.len(),
                loaded + missing.len(),
                missing.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        info!("Loaded {} pretrained encoder variables", loaded);
        Ok(loaded)
    }
}
