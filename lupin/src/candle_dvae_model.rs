//! Discrete variational autoencoder with an RBM prior.
//!
//! One model type covers the DVAE++ / GumBolt family. Variants differ
//! only in the strategies picked by [`ModelConfig`]: the smoothing
//! family inside the encoder, the conditioning policy and the output
//! model.
//!
//! The KL term is estimated as
//!
//!   KL = H(q, p) + log Z - H(q)
//!
//! where the cross-entropy H(q, p) against the unnormalized RBM is
//! computed from the posterior marginals, and the gradient of log Z is
//! supplied by the negative phase `-mean E(v, h)` over persistent
//! chain samples.

use crate::candle_decoder_basic::BasicDecoder;
use crate::candle_encoder_hierarchical::HierarchicalEncoder;
use crate::candle_loss_functions::*;
use crate::candle_model_traits::*;
use crate::candle_noise::NoiseSource;
use crate::candle_pcd_sampler::{ChainDiagnostics, ChainState, PcdSampler};
use crate::candle_rbm_prior::RbmPrior;
use crate::model_config::{ModelConfig, OutputKind};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{ops, VarBuilder};
use log::debug;
use std::collections::BTreeMap;

/// Distribution of the observed data given the latent sample
#[derive(Clone, Debug)]
pub enum OutputDistribution {
    Bernoulli { logits: Tensor },
    Continuous { mean: Tensor },
}

impl OutputDistribution {
    /// Per-sample reconstruction loss
    ///
    /// Bernoulli: -log p(x | z) summed over features;
    /// Continuous: squared error summed over features
    pub fn reconstruction_loss(&self, x_nd: &Tensor) -> Result<Tensor> {
        match self {
            OutputDistribution::Bernoulli { logits } => bernoulli_likelihood(x_nd, logits)?.neg(),
            OutputDistribution::Continuous { mean } => squared_error(x_nd, mean),
        }
    }

    /// E[x | z]
    pub fn mean(&self) -> Result<Tensor> {
        match self {
            OutputDistribution::Bernoulli { logits } => ops::sigmoid(logits),
            OutputDistribution::Continuous { mean } => Ok(mean.clone()),
        }
    }
}

/// Everything one forward call produces; built fresh for every batch
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    pub posterior: PosteriorLatent,
    pub output_activations: Tensor,
    pub output_distribution: OutputDistribution,
    pub output_data: Tensor,
    /// mode the forward call ran in
    pub train: bool,
}

/// Terms of the KL estimate
#[derive(Clone, Debug)]
pub struct KlTerms {
    pub kl_loss: Tensor,
    /// mean posterior entropy
    pub entropy: Tensor,
    /// cross-entropy of the posterior against the unnormalized prior
    pub pos_energy: Tensor,
    /// -mean energy of the persistent chain samples
    pub neg_energy: Tensor,
}

/// Named loss components of one batch
#[derive(Clone, Debug)]
pub struct LossOutput {
    /// `ae_loss + kl_loss`, the objective to backpropagate
    pub loss: Tensor,
    pub ae_loss: Tensor,
    pub kl_loss: Tensor,
    pub entropy: Tensor,
    pub pos_energy: Tensor,
    pub neg_energy: Tensor,
}

impl LossOutput {
    pub fn named(&self) -> BTreeMap<&'static str, &Tensor> {
        BTreeMap::from([
            ("loss", &self.loss),
            ("ae_loss", &self.ae_loss),
            ("kl_loss", &self.kl_loss),
            ("entropy", &self.entropy),
            ("pos_energy", &self.pos_energy),
            ("neg_energy", &self.neg_energy),
        ])
    }

    pub fn scalars(&self) -> Result<BTreeMap<&'static str, f32>> {
        self.named()
            .into_iter()
            .map(|(k, v)| Ok((k, v.to_dtype(DType::F32)?.to_scalar::<f32>()?)))
            .collect()
    }
}

/// Output of [`DiscreteVae::generate_samples`], detached from any graph
#[derive(Clone, Debug)]
pub struct GeneratedSamples {
    /// conditioning used per sample; `None` for unconditioned models
    pub conditioning: Option<Tensor>,
    pub outputs: Tensor,
}

pub struct DiscreteVae<Enc = HierarchicalEncoder, Dec = BasicDecoder>
where
    Enc: DiscreteEncoderT,
    Dec: DecoderModuleT,
{
    config: ModelConfig,
    encoder: Enc,
    decoder: Dec,
    prior: RbmPrior,
    sampler: PcdSampler,
    noise: NoiseSource,
    dataset_mean: Option<Tensor>, // 1 x d
    train_bias: Option<Tensor>,   // 1 x d
    device: Device,
}

impl DiscreteVae<HierarchicalEncoder, BasicDecoder> {
    /// Build every component from `config`; variables live under
    /// `enc.*`, `dec.*` and `prior.*`
    pub fn new(config: &ModelConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;
        let device = vs.device().clone();

        let encoder = HierarchicalEncoder::new(&config.encoder_args(), vs.pp("enc"))?;
        let decoder = BasicDecoder::new(
            config.decoder_input_dim(),
            &config.decoder_layers,
            config.input_dim,
            config.activation,
            vs.pp("dec"),
        )?;

        let n_visible = config.num_var_rbm();
        let n_hidden = config.num_latent_units() - n_visible;
        let prior = RbmPrior::new(n_visible, n_hidden, vs.pp("prior"))?;

        let sampler = PcdSampler::new(
            &prior,
            config.sampler_batch_size,
            config.n_gibbs_sampling_steps,
            sampler_seed(config.seed),
            &device,
        )?;

        Self::from_parts(config, encoder, decoder, prior, sampler)
    }
}

/// the sampler's stream is derived from, but distinct from, the model seed
fn sampler_seed(seed: u64) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1)
}

impl<Enc, Dec> DiscreteVae<Enc, Dec>
where
    Enc: DiscreteEncoderT,
    Dec: DecoderModuleT,
{
    /// Assemble a model from explicit components, checking that their
    /// dimensions agree with `config`
    pub fn from_parts(
        config: &ModelConfig,
        encoder: Enc,
        decoder: Dec,
        prior: RbmPrior,
        sampler: PcdSampler,
    ) -> Result<Self> {
        config.validate()?;

        if encoder.dim_obs() != config.encoder_input_dim()
            || encoder.dim_latent() != config.num_latent_units()
        {
            candle_core::bail!(
                "encoder {} -> {} does not match config {} -> {}",
                encoder.dim_obs(),
                encoder.dim_latent(),
                config.encoder_input_dim(),
                config.num_latent_units()
            );
        }
        if decoder.dim_latent() != config.decoder_input_dim()
            || decoder.dim_obs() != config.input_dim
        {
            candle_core::bail!(
                "decoder {} -> {} does not match config {} -> {}",
                decoder.dim_latent(),
                decoder.dim_obs(),
                config.decoder_input_dim(),
                config.input_dim
            );
        }
        if prior.n_visible() != config.num_var_rbm()
            || prior.n_visible() + prior.n_hidden() != config.num_latent_units()
        {
            candle_core::bail!(
                "RBM {} x {} does not cover {} latent units split at {}",
                prior.n_visible(),
                prior.n_hidden(),
                config.num_latent_units(),
                config.num_var_rbm()
            );
        }
        let (_, chain_v) = sampler.chain().visible.dims2()?;
        let (_, chain_h) = sampler.chain().hidden.dims2()?;
        if chain_v != prior.n_visible() || chain_h != prior.n_hidden() {
            candle_core::bail!("sampler chain does not match the RBM layers");
        }

        let device = prior.get_weights().device().clone();

        Ok(Self {
            config: config.clone(),
            encoder,
            decoder,
            prior,
            sampler,
            noise: NoiseSource::new(config.seed),
            dataset_mean: None,
            train_bias: None,
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn prior(&self) -> &RbmPrior {
        &self.prior
    }

    pub fn sampler(&self) -> &PcdSampler {
        &self.sampler
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// whether `forward` needs a conditioning tensor
    pub fn requires_conditioning(&self) -> bool {
        self.config.conditioning.is_required()
    }

    /// Change the smoothing temperature of the encoder
    pub fn set_beta(&mut self, beta: f64) -> Result<()> {
        self.encoder.set_beta(beta)?;
        self.config.beta = beta;
        Ok(())
    }

    /// Restart both the posterior noise and the chain noise
    pub fn reseed(&mut self, seed: u64) {
        self.noise.reseed(seed);
        self.sampler.reseed(sampler_seed(seed));
    }

    /// Register the per-feature training-set mean
    ///
    /// Used to center encoder inputs (`center_input`) and, for
    /// Bernoulli outputs, as the decoder's base log-odds
    /// `logit(clamp(mean, 1e-3, 1 - 1e-3))`.
    pub fn set_dataset_mean(&mut self, mean: &Tensor) -> Result<()> {
        let mean_1d = mean.flatten_all()?.unsqueeze(0)?.to_device(&self.device)?;
        let (_, d) = mean_1d.dims2()?;
        if d != self.config.input_dim {
            candle_core::bail!(
                "dataset mean has {} features, model expects {}",
                d,
                self.config.input_dim
            );
        }
        if self.config.output == OutputKind::Bernoulli {
            let p = mean_1d.clamp(1e-3, 1. - 1e-3)?;
            let logit = (p.log()? - p.affine(-1., 1.)?.log()?)?;
            self.train_bias = Some(logit.detach());
        }
        self.dataset_mean = Some(mean_1d.detach());
        Ok(())
    }

    pub fn dataset_mean(&self) -> Option<&Tensor> {
        self.dataset_mean.as_ref()
    }

    fn check_conditioning(
        &self,
        n: usize,
        conditioning: Option<&Tensor>,
    ) -> Result<Option<Tensor>> {
        let dim = self.config.conditioning.dim();
        match (dim, conditioning) {
            (0, None) => Ok(None),
            (0, Some(_)) => {
                candle_core::bail!("this model takes no conditioning, but one was given")
            }
            (_, None) => candle_core::bail!("this model requires a {}-wide conditioning", dim),
            (_, Some(c)) => {
                let c = if c.rank() == 1 { c.unsqueeze(1)? } else { c.clone() };
                let (nc, dc) = c.dims2()?;
                if nc != n || dc != dim {
                    candle_core::bail!(
                        "conditioning {:?} does not align with {} samples x {} features",
                        c.dims(),
                        n,
                        dim
                    );
                }
                Ok(Some(c.to_dtype(DType::F32)?))
            }
        }
    }

    fn output_distribution(&self, raw_nd: Tensor) -> Result<(Tensor, OutputDistribution)> {
        match self.config.output {
            OutputKind::Bernoulli => {
                let act = match &self.train_bias {
                    Some(bias) => raw_nd.broadcast_add(bias)?,
                    None => raw_nd,
                };
                let dist = OutputDistribution::Bernoulli { logits: act.clone() };
                Ok((act, dist))
            }
            OutputKind::Continuous => {
                let act = raw_nd.relu()?;
                let dist = OutputDistribution::Continuous { mean: act.clone() };
                Ok((act, dist))
            }
        }
    }

    /// Encode, sample the latent hierarchy and decode
    ///
    /// * `x` - input batch (n x d, higher ranks are flattened)
    /// * `conditioning` - (n x c) side information; must be `Some`
    ///   exactly when the model is conditioned
    /// * `train` - training or evaluation mode, fixed for the batch
    pub fn forward(
        &mut self,
        x: &Tensor,
        conditioning: Option<&Tensor>,
        train: bool,
    ) -> Result<ForwardOutput> {
        let x_nd = flatten_input(x, self.config.input_dim)?;
        let (n, _) = x_nd.dims2()?;
        let cond = self.check_conditioning(n, conditioning)?;

        let x_in = match (&self.dataset_mean, self.config.center_input) {
            (Some(mean), true) => x_nd.broadcast_sub(mean)?,
            _ => x_nd,
        };
        let enc_in = match &cond {
            Some(c) => Tensor::cat(&[&x_in, c], 1)?,
            None => x_in,
        };

        let posterior = self.encoder.forward_t(&enc_in, &mut self.noise, train)?;

        let z_nk = posterior.concat_samples()?;
        let dec_in = match &cond {
            Some(c) => Tensor::cat(&[&z_nk, c], 1)?,
            None => z_nk,
        };

        let (output_activations, output_distribution) =
            self.output_distribution(self.decoder.forward(&dec_in)?)?;
        let output_data = output_distribution.mean()?;

        debug!("forward: {} samples, train = {}", n, train);

        Ok(ForwardOutput {
            posterior,
            output_activations,
            output_distribution,
            output_data,
            train,
        })
    }

    /// Reconstruction + KL loss of one batch
    ///
    /// The cross-entropy path follows the mode `fwd` was computed in.
    pub fn loss(&mut self, x: &Tensor, fwd: &ForwardOutput) -> Result<LossOutput> {
        let x_nd = flatten_input(x, self.config.input_dim)?;

        let ae_loss = fwd
            .output_distribution
            .reconstruction_loss(&x_nd)?
            .mean(0)?;
        let kl = self.kl_divergence(&fwd.posterior, fwd.train)?;
        let loss = (&ae_loss + &kl.kl_loss)?;

        ensure_finite("ae_loss", &ae_loss)?;
        ensure_finite("kl_loss", &kl.kl_loss)?;

        Ok(LossOutput {
            loss,
            ae_loss,
            kl_loss: kl.kl_loss,
            entropy: kl.entropy,
            pos_energy: kl.pos_energy,
            neg_energy: kl.neg_energy,
        })
    }

    /// Per-sample posterior entropy, concatenated logits and log-ratios
    ///
    /// With a single hierarchy level the log-ratio is zero (mean-field).
    pub fn posterior_statistics(
        &self,
        posterior: &PosteriorLatent,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let mut entropy_n: Option<Tensor> = None;
        let mut log_ratio = Vec::with_capacity(posterior.num_levels());

        for (logits, samples) in posterior.logits.iter().zip(posterior.samples.iter()) {
            let factorial = self.encoder.smoothing_dist(logits, posterior.beta)?;
            let h_n = factorial.entropy()?.sum(1)?;
            entropy_n = Some(match entropy_n {
                Some(acc) => (acc + h_n)?,
                None => h_n,
            });
            log_ratio.push(factorial.log_ratio(samples)?);
        }

        let entropy_n = match entropy_n {
            Some(h) => h,
            None => candle_core::bail!("posterior has no hierarchy levels"),
        };
        let logit_q = posterior.concat_logits()?;
        let log_ratio = if posterior.num_levels() == 1 {
            logit_q.zeros_like()?
        } else {
            Tensor::cat(&log_ratio, 1)?
        };
        Ok((entropy_n, logit_q, log_ratio))
    }

    /// Concatenated log-ratio term entering the cross-entropy
    pub fn posterior_log_ratio(&self, posterior: &PosteriorLatent) -> Result<Tensor> {
        Ok(self.posterior_statistics(posterior)?.2)
    }

    /// KL between the hierarchical posterior and the RBM prior
    ///
    /// Advances the persistent chain by one `block_gibbs_sampling` call.
    ///
    /// * `train` - factorized cross-entropy from marginals when true,
    ///   energy of the relaxed samples otherwise
    pub fn kl_divergence(&mut self, posterior: &PosteriorLatent, train: bool) -> Result<KlTerms> {
        let (entropy_n, logit_q, log_ratio) = self.posterior_statistics(posterior)?;

        let cross_entropy = if train {
            self.cross_entropy_from_hierarchical(&logit_q, &log_ratio)?
        } else {
            let (zeta_v, zeta_h) = self.split_rbm(&posterior.concat_samples()?)?;
            self.prior.energy(&zeta_v, &zeta_h)?.mean(0)?
        };

        // negative phase: detached chain samples, live parameters
        let (rbm_vis, rbm_hid) = self.sample_prior()?;
        let batch_energy = self.prior.energy(&rbm_vis.detach(), &rbm_hid.detach())?;
        let neg_energy = batch_energy.mean(0)?.neg()?;

        let entropy = entropy_n.mean(0)?;
        let kl_loss = ((&cross_entropy + &neg_energy)? - &entropy)?;

        Ok(KlTerms {
            kl_loss,
            entropy,
            pos_energy: cross_entropy,
            neg_energy,
        })
    }

    /// Cross-entropy between a hierarchical posterior and the
    /// unnormalized RBM
    ///
    /// The logits split at `num_var_rbm` into the visible and hidden
    /// halves; the coupling uses the log-ratio corrected marginals
    /// q1' = σ(l1 + log_ratio1):
    ///
    ///   H = mean_n [ -q1·b_v - q2·b_h - q1' W q2ᵗ ]
    pub fn cross_entropy_from_hierarchical(
        &self,
        logits: &Tensor,
        log_ratio: &Tensor,
    ) -> Result<Tensor> {
        let (logit_q1, logit_q2) = self.split_rbm(logits)?;
        let (log_ratio_1, _) = self.split_rbm(log_ratio)?;

        let q1 = ops::sigmoid(&logit_q1)?;
        let q2 = ops::sigmoid(&logit_q2)?;
        let q1_pert = ops::sigmoid(&(&logit_q1 + &log_ratio_1)?)?;

        let vis_n = q1.broadcast_mul(self.prior.get_visible_bias())?.sum(1)?;
        let hid_n = q2.broadcast_mul(self.prior.get_hidden_bias())?.sum(1)?;
        let coupling_n = q1_pert
            .matmul(self.prior.get_weights())?
            .mul(&q2)?
            .sum(1)?;

        let cross_entropy_n = ((vis_n + hid_n)? + coupling_n)?.neg()?;
        cross_entropy_n.mean(0)
    }

    fn split_rbm(&self, latent_nk: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, k) = latent_nk.dims2()?;
        let num_var_rbm = self.config.num_var_rbm();
        if k != self.config.num_latent_units() {
            candle_core::bail!(
                "expected {} latent units, got {}",
                self.config.num_latent_units(),
                k
            );
        }
        Ok((
            latent_nk.narrow(1, 0, num_var_rbm)?,
            latent_nk.narrow(1, num_var_rbm, k - num_var_rbm)?,
        ))
    }

    /// Decode prior samples drawn from the persistent chain
    ///
    /// Runs as many `block_gibbs_sampling` calls as needed to cover
    /// `num_samples`, then keeps exactly the first `num_samples`.
    ///
    /// * `num_samples` - number of generated outputs
    /// * `conditioning` - fixed conditioning value for every sample;
    ///   conditioned models draw U(0, max_conditioning_value) if `None`
    pub fn generate_samples(
        &mut self,
        num_samples: usize,
        conditioning: Option<f64>,
    ) -> Result<GeneratedSamples> {
        if num_samples == 0 {
            candle_core::bail!("num_samples must be > 0");
        }
        let cond_dim = self.config.conditioning.dim();
        if cond_dim == 0 && conditioning.is_some() {
            candle_core::bail!("this model takes no conditioning, but one was given");
        }

        let batch_size = self.sampler.get_batch_size();
        let num_iterations = num_samples.div_ceil(batch_size);

        let mut outputs = Vec::with_capacity(num_iterations);
        let mut conditions = Vec::with_capacity(num_iterations);

        for _ in 0..num_iterations {
            let (rbm_vis, rbm_hid) = self.sample_prior()?;
            let prior_samples = Tensor::cat(&[&rbm_vis.detach(), &rbm_hid.detach()], 1)?;

            let dec_in = if cond_dim > 0 {
                let cond = match conditioning {
                    Some(value) => {
                        Tensor::full(value as f32, (batch_size, cond_dim), &self.device)?
                    }
                    None => self.noise.uniform_range(
                        (batch_size, cond_dim),
                        0.0,
                        self.config.max_conditioning_value as f32,
                        &self.device,
                    )?,
                };
                let dec_in = Tensor::cat(&[&prior_samples, &cond], 1)?;
                conditions.push(cond);
                dec_in
            } else {
                prior_samples
            };

            let (_, dist) = self.output_distribution(self.decoder.forward(&dec_in)?)?;
            outputs.push(dist.mean()?.detach());
        }

        let outputs = Tensor::cat(&outputs, 0)?.narrow(0, 0, num_samples)?;
        let conditioning = if conditions.is_empty() {
            None
        } else {
            Some(Tensor::cat(&conditions, 0)?.narrow(0, 0, num_samples)?.detach())
        };

        Ok(GeneratedSamples {
            conditioning,
            outputs,
        })
    }

    /// Advance the persistent chain by one `block_gibbs_sampling` call
    pub fn sample_prior(&mut self) -> Result<(Tensor, Tensor)> {
        self.sampler.block_gibbs_sampling(&self.prior)
    }

    /// Replace the persistent chain, e.g. when restoring a checkpoint
    pub fn reset_chain(&mut self, chain: ChainState) -> Result<()> {
        self.sampler.reset(&self.prior, chain)
    }

    /// Mean energy and activity of the persistent chain
    pub fn chain_diagnostics(&self) -> Result<ChainDiagnostics> {
        self.sampler.diagnostics(&self.prior)
    }
}

fn flatten_input(x: &Tensor, input_dim: usize) -> Result<Tensor> {
    let x_nd = if x.rank() > 2 { x.flatten_from(1)? } else { x.clone() };
    let (_, d) = x_nd.dims2()?;
    if d != input_dim {
        candle_core::bail!("expected {} input features, got {}", input_dim, d);
    }
    Ok(x_nd)
}
