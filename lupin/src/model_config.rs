use crate::candle_aux_layers::HiddenActivation;
use crate::candle_encoder_hierarchical::HierarchicalEncoderArgs;
use crate::candle_smoothing::SmootherKind;
use candle_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Side information appended to encoder and decoder inputs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conditioning {
    None,
    /// a `dim`-wide vector per sample, e.g. the incident energy
    Vector { dim: usize },
}

impl Conditioning {
    pub fn dim(&self) -> usize {
        match self {
            Conditioning::None => 0,
            Conditioning::Vector { dim } => *dim,
        }
    }

    pub fn is_required(&self) -> bool {
        self.dim() > 0
    }
}

/// Statistical model of the decoder output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Bernoulli pixels: sigmoid output, binary cross entropy
    Bernoulli,
    /// continuous deposits: ReLU output, squared error
    Continuous,
}

/// Named model variants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// overlapping-exponential smoothing, Bernoulli output
    #[value(name = "dvaepp")]
    DvaePp,
    /// Gumbel smoothing, Bernoulli output
    #[value(name = "gumbolt")]
    GumBolt,
    /// Gumbel smoothing, energy-conditioned, continuous output
    #[value(name = "gumbolt-calo")]
    GumBoltCalo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub n_latent_hierarchy_lvls: usize,
    /// latent units per hierarchy level
    pub n_latent_nodes: usize,
    pub n_encoder_layers: usize,
    pub n_encoder_layer_nodes: usize,
    /// hidden layer widths of the decoder
    pub decoder_layers: Vec<usize>,
    pub skip_latent_layer: bool,
    pub n_gibbs_sampling_steps: usize,
    /// number of persistent chains
    pub sampler_batch_size: usize,
    /// inverse temperature of the smoothing distribution
    pub beta: f64,
    pub smoother: SmootherKind,
    pub conditioning: Conditioning,
    pub output: OutputKind,
    /// subtract the dataset mean before encoding
    pub center_input: bool,
    pub activation: HiddenActivation,
    /// upper end of U(0, max) conditioning drawn at generation time
    pub max_conditioning_value: f64,
    pub seed: u64,
}

impl ModelConfig {
    pub fn preset(kind: ModelKind, input_dim: usize) -> Self {
        let base = Self {
            input_dim,
            n_latent_hierarchy_lvls: 2,
            n_latent_nodes: 32,
            n_encoder_layers: 2,
            n_encoder_layer_nodes: 128,
            decoder_layers: vec![128, 128],
            skip_latent_layer: false,
            n_gibbs_sampling_steps: 40,
            sampler_batch_size: 128,
            beta: 4.0,
            smoother: SmootherKind::MixtureExp,
            conditioning: Conditioning::None,
            output: OutputKind::Bernoulli,
            center_input: true,
            activation: HiddenActivation::Relu,
            max_conditioning_value: 100.0,
            seed: 42,
        };
        match kind {
            ModelKind::DvaePp => base,
            ModelKind::GumBolt => Self {
                smoother: SmootherKind::Gumbel,
                beta: 2.0,
                ..base
            },
            ModelKind::GumBoltCalo => Self {
                smoother: SmootherKind::Gumbel,
                beta: 2.0,
                conditioning: Conditioning::Vector { dim: 1 },
                output: OutputKind::Continuous,
                center_input: false,
                ..base
            },
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// total latent units over all levels
    pub fn num_latent_units(&self) -> usize {
        self.n_latent_hierarchy_lvls * self.n_latent_nodes
    }

    /// the latent vector splits into visible | hidden halves of the RBM
    pub fn num_var_rbm(&self) -> usize {
        self.num_latent_units() / 2
    }

    pub fn encoder_input_dim(&self) -> usize {
        self.input_dim + self.conditioning.dim()
    }

    pub fn decoder_input_dim(&self) -> usize {
        self.num_latent_units() + self.conditioning.dim()
    }

    pub fn encoder_args(&self) -> HierarchicalEncoderArgs {
        HierarchicalEncoderArgs {
            n_input: self.encoder_input_dim(),
            n_latent_hierarchy_lvls: self.n_latent_hierarchy_lvls,
            n_latent_nodes: self.n_latent_nodes,
            n_encoder_layers: self.n_encoder_layers,
            n_encoder_layer_nodes: self.n_encoder_layer_nodes,
            skip_latent_layer: self.skip_latent_layer,
            smoother: self.smoother,
            beta: self.beta,
            activation: self.activation,
        }
    }

    /// Reject configurations that cannot build a model
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            candle_core::bail!("input_dim must be > 0");
        }
        if self.n_latent_hierarchy_lvls == 0 {
            candle_core::bail!("n_latent_hierarchy_lvls must be > 0");
        }
        if self.n_latent_nodes == 0 {
            candle_core::bail!("n_latent_nodes must be > 0");
        }
        if self.num_latent_units() % 2 != 0 {
            candle_core::bail!(
                "{} levels x {} units = {} latent units do not split evenly into RBM halves",
                self.n_latent_hierarchy_lvls,
                self.n_latent_nodes,
                self.num_latent_units()
            );
        }
        if self.n_encoder_layers > 0 && self.n_encoder_layer_nodes == 0 {
            candle_core::bail!("n_encoder_layer_nodes must be > 0 with hidden encoder layers");
        }
        if self.decoder_layers.contains(&0) {
            candle_core::bail!("decoder_layers must not contain zero widths");
        }
        if self.n_gibbs_sampling_steps == 0 {
            candle_core::bail!("n_gibbs_sampling_steps must be > 0");
        }
        if self.sampler_batch_size == 0 {
            candle_core::bail!("sampler_batch_size must be > 0");
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            candle_core::bail!("beta must be finite and > 0, got {}", self.beta);
        }
        if let Conditioning::Vector { dim: 0 } = self.conditioning {
            candle_core::bail!("vector conditioning needs dim > 0");
        }
        if !(self.max_conditioning_value.is_finite() && self.max_conditioning_value > 0.0) {
            candle_core::bail!("max_conditioning_value must be finite and > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() -> Result<()> {
        for kind in [ModelKind::DvaePp, ModelKind::GumBolt, ModelKind::GumBoltCalo] {
            ModelConfig::preset(kind, 784).validate()?;
        }
        let calo = ModelConfig::preset(ModelKind::GumBoltCalo, 504);
        assert_eq!(calo.encoder_input_dim(), 505);
        assert_eq!(calo.decoder_input_dim(), 65);
        assert_eq!(calo.num_var_rbm(), 32);
        Ok(())
    }

    #[test]
    fn odd_latent_count_is_rejected() {
        let mut cfg = ModelConfig::preset(ModelKind::DvaePp, 16);
        cfg.n_latent_hierarchy_lvls = 1;
        cfg.n_latent_nodes = 7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let mut cfg = ModelConfig::preset(ModelKind::GumBolt, 16);
        cfg.n_latent_nodes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ModelConfig::preset(ModelKind::GumBolt, 0);
        assert!(cfg.validate().is_err());
        cfg.input_dim = 16;
        cfg.n_gibbs_sampling_steps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.json");
        let cfg = ModelConfig::preset(ModelKind::GumBoltCalo, 32);
        cfg.to_json_file(&path)?;
        let back = ModelConfig::from_json_file(&path)?;
        assert_eq!(back.conditioning, Conditioning::Vector { dim: 1 });
        assert_eq!(back.output, OutputKind::Continuous);
        assert_eq!(back.decoder_layers, cfg.decoder_layers);
        Ok(())
    }
}
