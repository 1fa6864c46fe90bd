use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::candle_noise::NoiseSource;
use crate::candle_smoothing::{SmootherKind, SmoothingDistT};
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use log::debug;

/// Shape of a hierarchical encoder
#[derive(Clone, Debug)]
pub struct HierarchicalEncoderArgs {
    pub n_input: usize,
    pub n_latent_hierarchy_lvls: usize,
    pub n_latent_nodes: usize,
    pub n_encoder_layers: usize,
    pub n_encoder_layer_nodes: usize,
    pub skip_latent_layer: bool,
    pub smoother: SmootherKind,
    pub beta: f64,
    pub activation: HiddenActivation,
}

/// Encoder over a hierarchy of discrete latent groups
///
/// Level `i` sees the input and the relaxed samples of levels `0..i`:
///
///   l_i = f_i([x, ζ_0, ..., ζ_{i-1}]),  ζ_i ~ r(ζ | l_i, β)
///
pub struct HierarchicalEncoder {
    n_input: usize,
    n_latent_nodes: usize,
    smoother: SmootherKind,
    beta: f64,
    level_nets: Vec<StackLayers<Linear>>,
}

impl HierarchicalEncoder {
    /// Will create a new hierarchical encoder with these variables:
    ///
    /// * `level.{i}.fc.{j}.weight` where {i} is the hierarchy level
    ///   and {j} the layer index
    ///
    /// With `skip_latent_layer` the innermost (last) level maps its
    /// input straight to logits, without hidden layers.
    pub fn new(args: &HierarchicalEncoderArgs, vs: VarBuilder) -> Result<Self> {
        if args.n_input == 0 {
            candle_core::bail!("encoder input dimension must be > 0");
        }
        if args.n_latent_hierarchy_lvls == 0 || args.n_latent_nodes == 0 {
            candle_core::bail!(
                "latent hierarchy must have >0 levels of >0 units, got {} x {}",
                args.n_latent_hierarchy_lvls,
                args.n_latent_nodes
            );
        }
        if args.n_encoder_layers > 0 && args.n_encoder_layer_nodes == 0 {
            candle_core::bail!("encoder hidden layers need a width > 0");
        }
        if !(args.beta > 0.0) {
            candle_core::bail!("beta must be > 0, got {}", args.beta);
        }

        let hidden = vec![args.n_encoder_layer_nodes; args.n_encoder_layers];
        let n_levels = args.n_latent_hierarchy_lvls;

        let mut level_nets = Vec::with_capacity(n_levels);
        for i in 0..n_levels {
            let in_dim = args.n_input + i * args.n_latent_nodes;
            let innermost = i + 1 == n_levels;
            let layers: &[usize] = if innermost && args.skip_latent_layer {
                &[]
            } else {
                &hidden
            };
            level_nets.push(linear_stack(
                in_dim,
                layers,
                args.n_latent_nodes,
                args.activation,
                vs.pp(format!("level.{}.fc", i)),
            )?);
        }

        Ok(Self {
            n_input: args.n_input,
            n_latent_nodes: args.n_latent_nodes,
            smoother: args.smoother,
            beta: args.beta,
            level_nets,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.level_nets.len()
    }
}

impl DiscreteEncoderT for HierarchicalEncoder {
    fn forward_t(
        &self,
        x_nd: &Tensor,
        noise: &mut NoiseSource,
        _train: bool,
    ) -> Result<PosteriorLatent> {
        let (n, d) = x_nd.dims2()?;
        if d != self.n_input {
            candle_core::bail!("encoder expects {} input features, got {}", self.n_input, d);
        }

        let mut logits = Vec::with_capacity(self.num_levels());
        let mut samples: Vec<Tensor> = Vec::with_capacity(self.num_levels());

        for (i, net) in self.level_nets.iter().enumerate() {
            let h_nd = if samples.is_empty() {
                x_nd.clone()
            } else {
                let mut parts = Vec::with_capacity(samples.len() + 1);
                parts.push(x_nd.clone());
                parts.extend(samples.iter().cloned());
                Tensor::cat(&parts, 1)?
            };

            let logits_nk = net.forward(&h_nd)?;
            let u_nk = noise.uniform((n, self.n_latent_nodes), x_nd.device())?;
            let zeta_nk = self
                .smoothing_dist(&logits_nk, self.beta)?
                .sample(&u_nk.to_dtype(logits_nk.dtype())?)?;

            debug!("encoder level {}: {:?}", i, logits_nk.dims());
            logits.push(logits_nk);
            samples.push(zeta_nk);
        }

        Ok(PosteriorLatent {
            beta: self.beta,
            logits,
            samples,
        })
    }

    fn smoothing_dist(&self, logits: &Tensor, beta: f64) -> Result<Box<dyn SmoothingDistT>> {
        self.smoother.build(logits, beta)
    }

    /// e.g. for annealing schedules
    fn set_beta(&mut self, beta: f64) -> Result<()> {
        if !(beta.is_finite() && beta > 0.0) {
            candle_core::bail!("beta must be finite and > 0, got {}", beta);
        }
        self.beta = beta;
        Ok(())
    }

    fn dim_obs(&self) -> usize {
        self.n_input
    }

    fn dim_latent(&self) -> usize {
        self.num_levels() * self.n_latent_nodes
    }
}
