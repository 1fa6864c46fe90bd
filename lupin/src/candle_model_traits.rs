use crate::candle_noise::NoiseSource;
use candle_core::{Result, Tensor};

/// Posterior over the discrete latent hierarchy for one minibatch
#[derive(Clone, Debug)]
pub struct PosteriorLatent {
    /// inverse temperature of the smoothing distribution
    pub beta: f64,
    /// one (n x k) logit tensor per hierarchy level
    pub logits: Vec<Tensor>,
    /// one (n x k) relaxed sample per hierarchy level
    pub samples: Vec<Tensor>,
}

impl PosteriorLatent {
    pub fn num_levels(&self) -> usize {
        self.logits.len()
    }

    /// levels concatenated along the feature axis: (n x Σk)
    pub fn concat_logits(&self) -> Result<Tensor> {
        Tensor::cat(&self.logits, 1)
    }

    /// levels concatenated along the feature axis: (n x Σk)
    pub fn concat_samples(&self) -> Result<Tensor> {
        Tensor::cat(&self.samples, 1)
    }
}

pub trait DiscreteEncoderT {
    /// An encoder that spits out logits and relaxed samples per level
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d), conditioning already appended
    /// * `noise` - uniform noise for the reparameterized samples
    /// * `train` - whether we are in training mode
    fn forward_t(
        &self,
        x_nd: &Tensor,
        noise: &mut NoiseSource,
        train: bool,
    ) -> Result<PosteriorLatent>;

    /// Smoothing distribution used for the level with these `logits`
    fn smoothing_dist(
        &self,
        logits: &Tensor,
        beta: f64,
    ) -> Result<Box<dyn crate::candle_smoothing::SmoothingDistT>>;

    /// Change the inverse temperature of the smoothing distribution
    fn set_beta(&mut self, beta: f64) -> Result<()>;

    fn dim_obs(&self) -> usize;

    /// total number of latent units over all levels
    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out pre-activation reconstruction
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    /// input width, latent units plus any conditioning
    fn dim_latent(&self) -> usize;
}
