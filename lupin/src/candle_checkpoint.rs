//! Single-file safetensors checkpoints.
//!
//! A checkpoint holds every variable of the model's `VarMap` under its
//! own name, the persistent chain under `pcd.chain.*`, and the dataset
//! mean under `data.mean` when one was registered. Loading writes the
//! variables back in place, so optimizers built on the same `VarMap`
//! keep working.

use crate::candle_dvae_model::DiscreteVae;
use crate::candle_model_traits::{DecoderModuleT, DiscreteEncoderT};
use crate::candle_pcd_sampler::ChainState;
use candle_core::Tensor;
use candle_nn::VarMap;
use log::info;
use std::collections::HashMap;
use std::path::Path;

pub const CHAIN_VISIBLE_KEY: &str = "pcd.chain.visible";
pub const CHAIN_HIDDEN_KEY: &str = "pcd.chain.hidden";
pub const DATASET_MEAN_KEY: &str = "data.mean";

pub fn save_checkpoint<P, Enc, Dec>(
    path: P,
    variable_map: &VarMap,
    model: &DiscreteVae<Enc, Dec>,
) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    Enc: DiscreteEncoderT,
    Dec: DecoderModuleT,
{
    let mut tensors: HashMap<String, Tensor> = {
        let vars = variable_map
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;
        vars.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect()
    };

    for key in [CHAIN_VISIBLE_KEY, CHAIN_HIDDEN_KEY, DATASET_MEAN_KEY] {
        if tensors.contains_key(key) {
            anyhow::bail!("variable name {} is reserved for checkpoints", key);
        }
    }

    let chain = model.sampler().chain();
    tensors.insert(CHAIN_VISIBLE_KEY.to_string(), chain.visible.clone());
    tensors.insert(CHAIN_HIDDEN_KEY.to_string(), chain.hidden.clone());
    if let Some(mean) = model.dataset_mean() {
        tensors.insert(DATASET_MEAN_KEY.to_string(), mean.clone());
    }

    candle_core::safetensors::save(&tensors, path.as_ref())?;
    info!(
        "saved {} tensors to {}",
        tensors.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Restore variables, chain state and dataset mean written by
/// [`save_checkpoint`]
///
/// Every variable of `variable_map` must be present with its shape.
pub fn load_checkpoint<P, Enc, Dec>(
    path: P,
    variable_map: &VarMap,
    model: &mut DiscreteVae<Enc, Dec>,
) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    Enc: DiscreteEncoderT,
    Dec: DecoderModuleT,
{
    let device = model.device().clone();
    let mut tensors = candle_core::safetensors::load(path.as_ref(), &device)?;

    let take = |tensors: &mut HashMap<String, Tensor>, key: &str| {
        tensors
            .remove(key)
            .ok_or(anyhow::anyhow!("checkpoint lacks {}", key))
    };

    let visible = take(&mut tensors, CHAIN_VISIBLE_KEY)?;
    let hidden = take(&mut tensors, CHAIN_HIDDEN_KEY)?;
    let mean = tensors.remove(DATASET_MEAN_KEY);

    {
        let vars = variable_map
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;
        for (name, var) in vars.iter() {
            let value = tensors
                .get(name)
                .ok_or(anyhow::anyhow!("checkpoint lacks variable {}", name))?;
            var.set(&value.to_dtype(var.dtype())?)?;
        }
    }

    model.reset_chain(ChainState { visible, hidden })?;
    if let Some(mean) = mean {
        model.set_dataset_mean(&mean)?;
    }

    info!("restored checkpoint from {}", path.as_ref().display());
    Ok(())
}
