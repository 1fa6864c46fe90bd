use super::*;
use crate::candle_checkpoint::save_checkpoint;
use crate::candle_data_loader::InMemoryData;
use crate::candle_dvae_inference::DvaeEngine;
use crate::candle_dvae_model::DiscreteVae;
use crate::candle_inference::TrainConfig;
use crate::candle_noise::NoiseSource;
use crate::model_config::{ModelConfig, ModelKind, OutputKind};
use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Output prefix: writes {out}.config.json and {out}.safetensors
    #[arg(short, long)]
    pub out: PathBuf,

    /// Model preset
    #[arg(short, long, value_enum, default_value = "dvaepp")]
    pub model: ModelKind,

    /// JSON model config; overrides the preset
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Training data, one sample per line; synthetic data if omitted
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Per-sample conditioning column(s) for conditioned models
    #[arg(long)]
    pub conditioning: Option<PathBuf>,

    /// Number of synthetic samples
    #[arg(long, default_value_t = 1000)]
    pub num_synthetic: usize,

    /// Feature dimension of synthetic samples
    #[arg(long, default_value_t = 64)]
    pub synthetic_dim: usize,

    #[arg(long, default_value_t = 20)]
    pub epochs: usize,

    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Use a GPU backend when compiled in
    #[arg(long, default_value_t = false)]
    pub gpu: bool,

    /// Report losses every this many minibatches
    #[arg(long, default_value_t = 0)]
    pub log_every: usize,

    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

pub fn run(args: &TrainArgs) -> Result<()> {
    let device = select_device(args.gpu)?;

    let (x_nd, cond) = match &args.data {
        Some(path) => {
            let x = read_matrix(path, &device)?;
            let cond = args
                .conditioning
                .as_ref()
                .map(|p| read_matrix(p, &device))
                .transpose()?;
            (x, cond)
        }
        None => {
            let mut noise = NoiseSource::new(args.seed);
            synthetic_data(
                args.model,
                args.num_synthetic,
                args.synthetic_dim,
                &mut noise,
                &device,
            )?
        }
    };

    let (_, input_dim) = x_nd.dims2()?;
    let mut config = match &args.config {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::preset(args.model, input_dim),
    };
    if config.input_dim != input_dim {
        anyhow::bail!(
            "config expects {} features, data has {}",
            config.input_dim,
            input_dim
        );
    }
    config.seed = args.seed;

    let mut data = InMemoryData::new(&x_nd)?;
    if let Some(cond) = &cond {
        data = data.with_conditioning(cond)?;
    }
    data.reseed(args.seed);

    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = DiscreteVae::new(&config, vs)?;
    model.set_dataset_mean(&data.feature_mean()?)?;

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
        log_every: args.log_every,
    };

    info!(
        "training {:?} on {} samples x {} features",
        args.model,
        data.num_samples(),
        input_dim
    );

    {
        let mut engine = DvaeEngine::new(&mut model, &varmap, &train_config)?;
        let trace = engine.train(&mut data, &train_config)?;
        if let Some(last) = trace.last() {
            info!("final training loss: {:?}", last.losses);
        }
    }

    let diag = model.chain_diagnostics()?;
    info!(
        "chain: mean energy {:.3}, visible activity {:.3}, hidden activity {:.3}",
        diag.mean_energy, diag.visible_activity, diag.hidden_activity
    );

    config.to_json_file(config_path(&args.out))?;
    save_checkpoint(checkpoint_path(&args.out), &varmap, &model)?;
    Ok(())
}

/// Noisy copies of a few random binary prototypes; conditioned presets
/// scale them into non-negative deposits with a U(0, max) energy
fn synthetic_data(
    kind: ModelKind,
    n: usize,
    dim: usize,
    noise: &mut NoiseSource,
    device: &Device,
) -> Result<(Tensor, Option<Tensor>)> {
    const NUM_PROTOTYPES: usize = 4;
    const FLIP_PROB: f32 = 0.05;

    let half = Tensor::full(0.5f32, (NUM_PROTOTYPES, dim), device)?;
    let prototypes = noise.bernoulli(&half)?;

    let assignment: Vec<u32> = noise
        .uniform(n, device)?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|u| ((u * NUM_PROTOTYPES as f32) as u32).min(NUM_PROTOTYPES as u32 - 1))
        .collect();
    let assignment = Tensor::from_vec(assignment, n, device)?;
    let clean = prototypes.index_select(&assignment, 0)?;

    let flips = noise.bernoulli(&Tensor::full(FLIP_PROB, (n, dim), device)?)?;
    // xor with the flip mask
    let x_nd = (&clean - &flips)?.abs()?;

    let preset = ModelConfig::preset(kind, dim);
    match preset.output {
        OutputKind::Bernoulli => Ok((x_nd, None)),
        OutputKind::Continuous => {
            let max = preset.max_conditioning_value as f32;
            let energy = noise.uniform_range((n, preset.conditioning.dim()), 0.0, max, device)?;
            let profile = (&x_nd + 0.1)?;
            let scale = energy
                .narrow(1, 0, 1)?
                .broadcast_div(&profile.sum_keepdim(1)?)?;
            Ok((profile.broadcast_mul(&scale)?, Some(energy)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_binary_data_is_binary() -> Result<()> {
        let mut noise = NoiseSource::new(0);
        let (x, cond) = synthetic_data(ModelKind::DvaePp, 50, 12, &mut noise, &Device::Cpu)?;
        assert!(cond.is_none());
        let vals: Vec<f32> = x.flatten_all()?.to_vec1()?;
        assert_eq!(vals.len(), 600);
        assert!(vals.iter().all(|&v| v == 0.0 || v == 1.0));
        Ok(())
    }

    #[test]
    fn synthetic_deposits_sum_to_energy() -> Result<()> {
        let mut noise = NoiseSource::new(0);
        let (x, cond) = synthetic_data(ModelKind::GumBoltCalo, 20, 8, &mut noise, &Device::Cpu)?;
        let e: Vec<f32> = cond
            .ok_or(anyhow::anyhow!("missing energy"))?
            .flatten_all()?
            .to_vec1()?;
        let totals: Vec<f32> = x.sum(1)?.to_vec1()?;
        for (t, e) in totals.iter().zip(e.iter()) {
            assert!((t - e).abs() < 1e-3 * e.max(1.0));
        }
        Ok(())
    }
}
