use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Feed-forward decoder from latent samples (plus conditioning) to
/// pre-activation outputs
pub struct BasicDecoder {
    n_obs: usize,
    n_input: usize,
    fc: StackLayers<Linear>,
}

impl BasicDecoder {
    /// Will create a new decoder with these variables:
    /// * `fc.{j}.weight`, `fc.{j}.bias`
    ///
    /// # Arguments
    /// * `n_input` - latent units plus conditioning width
    /// * `layers` - hidden layer widths
    /// * `n_obs` - output width (flattened input size)
    pub fn new(
        n_input: usize,
        layers: &[usize],
        n_obs: usize,
        activation: HiddenActivation,
        vs: VarBuilder,
    ) -> Result<Self> {
        if n_input == 0 || n_obs == 0 || layers.contains(&0) {
            candle_core::bail!(
                "decoder dimensions must be > 0: {} -> {:?} -> {}",
                n_input,
                layers,
                n_obs
            );
        }
        let fc = linear_stack(n_input, layers, n_obs, activation, vs.pp("fc"))?;
        Ok(Self { n_obs, n_input, fc })
    }
}

impl DecoderModuleT for BasicDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor> {
        let (_, k) = z_nk.dims2()?;
        if k != self.n_input {
            candle_core::bail!("decoder expects {} inputs, got {}", self.n_input, k);
        }
        self.fc.forward(z_nk)
    }

    fn dim_obs(&self) -> usize {
        self.n_obs
    }

    fn dim_latent(&self) -> usize {
        self.n_input
    }
}
