use lupin::candle_checkpoint::{load_checkpoint, save_checkpoint};
use lupin::candle_core::{DType, Device, Tensor};
use lupin::candle_data_loader::InMemoryData;
use lupin::candle_dvae_inference::DvaeEngine;
use lupin::candle_dvae_model::DiscreteVae;
use lupin::candle_inference::TrainConfig;
use lupin::candle_nn::{VarBuilder, VarMap};
use lupin::candle_noise::NoiseSource;
use lupin::model_config::{ModelConfig, ModelKind};

fn config() -> ModelConfig {
    ModelConfig {
        n_latent_hierarchy_lvls: 2,
        n_latent_nodes: 4,
        n_encoder_layers: 1,
        n_encoder_layer_nodes: 16,
        decoder_layers: vec![16],
        sampler_batch_size: 8,
        n_gibbs_sampling_steps: 4,
        ..ModelConfig::preset(ModelKind::DvaePp, 12)
    }
}

fn build(varmap: &VarMap) -> lupin::candle_core::Result<DiscreteVae> {
    let vs = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    DiscreteVae::new(&config(), vs)
}

#[test]
fn restored_model_continues_identically() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.safetensors");

    let half = Tensor::full(0.5f32, (30, 12), &dev)?;
    let x = NoiseSource::new(9).bernoulli(&half)?;
    let mut data = InMemoryData::new(&x)?;

    let varmap = VarMap::new();
    let mut model = build(&varmap)?;
    model.set_dataset_mean(&data.feature_mean()?)?;

    let train_config = TrainConfig {
        batch_size: 10,
        num_epochs: 2,
        show_progress: false,
        ..Default::default()
    };
    {
        let mut engine = DvaeEngine::new(&mut model, &varmap, &train_config)?;
        engine.train(&mut data, &train_config)?;
    }
    save_checkpoint(&path, &varmap, &model)?;

    let varmap2 = VarMap::new();
    let mut restored = build(&varmap2)?;
    load_checkpoint(&path, &varmap2, &mut restored)?;

    let w1: Vec<Vec<f32>> = model.prior().get_weights().to_vec2()?;
    let w2: Vec<Vec<f32>> = restored.prior().get_weights().to_vec2()?;
    assert_eq!(w1, w2);

    model.reseed(77);
    restored.reseed(77);
    for _ in 0..3 {
        let (v1, h1) = model.sample_prior()?;
        let (v2, h2) = restored.sample_prior()?;
        let v1: Vec<Vec<f32>> = v1.to_vec2()?;
        let v2: Vec<Vec<f32>> = v2.to_vec2()?;
        let h1: Vec<Vec<f32>> = h1.to_vec2()?;
        let h2: Vec<Vec<f32>> = h2.to_vec2()?;
        assert_eq!(v1, v2);
        assert_eq!(h1, h2);
    }

    let g1: Vec<Vec<f32>> = model.generate_samples(5, None)?.outputs.to_vec2()?;
    let g2: Vec<Vec<f32>> = restored.generate_samples(5, None)?.outputs.to_vec2()?;
    assert_eq!(g1, g2);
    Ok(())
}
