use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

/// Feed-forward stack of `M` layers, each optionally followed by an
/// activation
pub struct StackLayers<M>
where
    M: Module,
{
    layers: Vec<(M, Option<Activation>)>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.layers
            .iter()
            .try_fold(input.clone(), |x, (module, activation)| {
                let x = module.forward(&x)?;
                match activation {
                    Some(act) => act.forward(&x),
                    None => Ok(x),
                }
            })
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.layers.push((layer, Some(activation)));
    }

    pub fn push(&mut self, layer: M) {
        self.layers.push((layer, None));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Nonlinearity between the deterministic layers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenActivation {
    Relu,
    LeakyRelu,
    Silu,
    Sigmoid,
}

impl HiddenActivation {
    pub fn to_candle(self) -> Activation {
        match self {
            HiddenActivation::Relu => Activation::Relu,
            HiddenActivation::LeakyRelu => Activation::LeakyRelu(0.02),
            HiddenActivation::Silu => Activation::Silu,
            HiddenActivation::Sigmoid => Activation::Sigmoid,
        }
    }
}

/// Fully connected stack `in_dim -> hidden[0] -> ... -> out_dim`
///
/// Every hidden layer is followed by `activation`; the last layer is
/// linear. Variables are `{prefix}.{j}.weight`, `{prefix}.{j}.bias`.
///
/// * `in_dim` - input width
/// * `hidden` - widths of the hidden layers (may be empty)
/// * `out_dim` - output width
/// * `activation` - nonlinearity after each hidden layer
/// * `vs` - variable builder
pub fn linear_stack(
    in_dim: usize,
    hidden: &[usize],
    out_dim: usize,
    activation: HiddenActivation,
    vs: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev_dim = in_dim;
    for (j, &next_dim) in hidden.iter().enumerate() {
        fc.push_with_act(
            candle_nn::linear(prev_dim, next_dim, vs.pp(j.to_string()))?,
            activation.to_candle(),
        );
        prev_dim = next_dim;
    }
    fc.push(candle_nn::linear(
        prev_dim,
        out_dim,
        vs.pp(hidden.len().to_string()),
    )?);
    Ok(fc)
}
