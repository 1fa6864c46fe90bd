use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};

/// Restricted Boltzmann machine over binary visible/hidden units
///
/// E(v, h) = - v W hᵗ - v·b_v - h·b_h
///
/// The prior of the discrete latent space. Parameters are created in a
/// `VarMap` and only ever change through the optimizer.
pub struct RbmPrior {
    n_visible: usize,
    n_hidden: usize,
    weight_vh: Tensor,     // visible x hidden
    visible_bias: Tensor, // visible
    hidden_bias: Tensor,  // hidden
}

impl RbmPrior {
    /// Will create a new RBM with these variables:
    ///
    /// * `weight` - coupling matrix (visible x hidden), small random init
    /// * `bias.visible`
    /// * `bias.hidden`
    pub fn new(n_visible: usize, n_hidden: usize, vs: VarBuilder) -> Result<Self> {
        if n_visible == 0 || n_hidden == 0 {
            candle_core::bail!(
                "RBM needs at least one visible and one hidden unit, got {} x {}",
                n_visible,
                n_hidden
            );
        }
        let init_ws = candle_nn::Init::Randn {
            mean: 0.0,
            stdev: 0.01,
        };
        let weight_vh = vs.get_with_hints((n_visible, n_hidden), "weight", init_ws)?;
        let visible_bias = vs.get_with_hints(n_visible, "bias.visible", candle_nn::init::ZERO)?;
        let hidden_bias = vs.get_with_hints(n_hidden, "bias.hidden", candle_nn::init::ZERO)?;

        Ok(Self {
            n_visible,
            n_hidden,
            weight_vh,
            visible_bias,
            hidden_bias,
        })
    }

    /// Build an RBM directly from parameter tensors
    ///
    /// * `weight_vh` - (visible x hidden)
    /// * `visible_bias` - (visible)
    /// * `hidden_bias` - (hidden)
    pub fn from_tensors(
        weight_vh: Tensor,
        visible_bias: Tensor,
        hidden_bias: Tensor,
    ) -> Result<Self> {
        let (n_visible, n_hidden) = weight_vh.dims2()?;
        if visible_bias.dims() != [n_visible] || hidden_bias.dims() != [n_hidden] {
            candle_core::bail!(
                "RBM bias shapes {:?} / {:?} do not match weight {:?}",
                visible_bias.dims(),
                hidden_bias.dims(),
                weight_vh.dims()
            );
        }
        Ok(Self {
            n_visible,
            n_hidden,
            weight_vh,
            visible_bias,
            hidden_bias,
        })
    }

    /// The same model with the roles of the two layers swapped
    pub fn transposed(&self) -> Result<Self> {
        Self::from_tensors(
            self.weight_vh.t()?.contiguous()?,
            self.hidden_bias.clone(),
            self.visible_bias.clone(),
        )
    }

    pub fn n_visible(&self) -> usize {
        self.n_visible
    }

    pub fn n_hidden(&self) -> usize {
        self.n_hidden
    }

    /// graph-connected coupling matrix (visible x hidden)
    pub fn get_weights(&self) -> &Tensor {
        &self.weight_vh
    }

    /// graph-connected visible bias
    pub fn get_visible_bias(&self) -> &Tensor {
        &self.visible_bias
    }

    /// graph-connected hidden bias
    pub fn get_hidden_bias(&self) -> &Tensor {
        &self.hidden_bias
    }

    /// Per-sample energy
    ///
    /// * `v_nv` - visible states (n x visible)
    /// * `h_nh` - hidden states (n x hidden)
    ///
    /// Returns `e_n` (n). Gradients flow into the parameters and into
    /// whichever of `v_nv`, `h_nh` are attached to a graph.
    pub fn energy(&self, v_nv: &Tensor, h_nh: &Tensor) -> Result<Tensor> {
        self.check_layers(v_nv, h_nh)?;
        let coupling_n = v_nv.matmul(&self.weight_vh)?.mul(h_nh)?.sum(1)?;
        let vis_n = v_nv.broadcast_mul(&self.visible_bias)?.sum(1)?;
        let hid_n = h_nh.broadcast_mul(&self.hidden_bias)?.sum(1)?;
        (coupling_n + vis_n)?.add(&hid_n)?.neg()
    }

    /// p(h = 1 | v) = σ(v W + b_h), with the parameters detached
    pub fn hidden_given_visible(&self, v_nv: &Tensor) -> Result<Tensor> {
        let logits = v_nv
            .matmul(&self.weight_vh.detach())?
            .broadcast_add(&self.hidden_bias.detach())?;
        ops::sigmoid(&logits)
    }

    /// p(v = 1 | h) = σ(h Wᵗ + b_v), with the parameters detached
    pub fn visible_given_hidden(&self, h_nh: &Tensor) -> Result<Tensor> {
        let logits = h_nh
            .matmul(&self.weight_vh.detach().t()?)?
            .broadcast_add(&self.visible_bias.detach())?;
        ops::sigmoid(&logits)
    }

    fn check_layers(&self, v_nv: &Tensor, h_nh: &Tensor) -> Result<()> {
        let (nv, dv) = v_nv.dims2()?;
        let (nh, dh) = h_nh.dims2()?;
        if dv != self.n_visible || dh != self.n_hidden || nv != nh {
            candle_core::bail!(
                "RBM energy expects (n x {}) and (n x {}), got {:?} and {:?}",
                self.n_visible,
                self.n_hidden,
                v_nv.dims(),
                h_nh.dims()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_rbm(nv: usize, nh: usize) -> Result<RbmPrior> {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1f32, (nv, nh), &dev)?;
        let bv = Tensor::randn(0f32, 1f32, nv, &dev)?;
        let bh = Tensor::randn(0f32, 1f32, nh, &dev)?;
        RbmPrior::from_tensors(w, bv, bh)
    }

    fn binary(n: usize, d: usize) -> Result<Tensor> {
        Tensor::rand(0f32, 1f32, (n, d), &Device::Cpu)?
            .ge(0.5)?
            .to_dtype(DType::F32)
    }

    #[test]
    fn energy_matches_explicit_sum() -> Result<()> {
        let rbm = random_rbm(3, 2)?;
        let v = binary(5, 3)?;
        let h = binary(5, 2)?;
        let energy: Vec<f32> = rbm.energy(&v, &h)?.to_vec1()?;

        let w: Vec<Vec<f32>> = rbm.get_weights().to_vec2()?;
        let bv: Vec<f32> = rbm.get_visible_bias().to_vec1()?;
        let bh: Vec<f32> = rbm.get_hidden_bias().to_vec1()?;
        let vv: Vec<Vec<f32>> = v.to_vec2()?;
        let hh: Vec<Vec<f32>> = h.to_vec2()?;

        for n in 0..5 {
            let mut e = 0f32;
            for i in 0..3 {
                e -= vv[n][i] * bv[i];
                for j in 0..2 {
                    e -= vv[n][i] * w[i][j] * hh[n][j];
                }
            }
            for j in 0..2 {
                e -= hh[n][j] * bh[j];
            }
            assert_abs_diff_eq!(energy[n], e, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn energy_is_linear_in_biases() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1f32, (4, 3), &dev)?;
        let bv = Tensor::randn(0f32, 1f32, 4, &dev)?;
        let bh = Tensor::randn(0f32, 1f32, 3, &dev)?;
        let v = binary(6, 4)?;
        let h = binary(6, 3)?;

        let base = RbmPrior::from_tensors(w.clone(), bv.clone(), bh.clone())?;
        let doubled = RbmPrior::from_tensors(w.clone(), (&bv * 2.0)?, bh.clone())?;
        let no_vis = RbmPrior::from_tensors(w, bv.zeros_like()?, bh)?;

        // E(2 b_v) - E(b_v) == E(b_v) - E(0)
        let lhs = (doubled.energy(&v, &h)? - base.energy(&v, &h)?)?;
        let rhs = (base.energy(&v, &h)? - no_vis.energy(&v, &h)?)?;
        let diff = (lhs - rhs)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff = {}", diff);
        Ok(())
    }

    #[test]
    fn energy_is_linear_in_hidden_bias() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1f32, (4, 3), &dev)?;
        let bv = Tensor::randn(0f32, 1f32, 4, &dev)?;
        let bh = Tensor::randn(0f32, 1f32, 3, &dev)?;
        let v = binary(6, 4)?;
        let h = binary(6, 3)?;

        let base = RbmPrior::from_tensors(w.clone(), bv.clone(), bh.clone())?;
        let doubled = RbmPrior::from_tensors(w.clone(), bv.clone(), (&bh * 2.0)?)?;
        let no_hid = RbmPrior::from_tensors(w, bv, bh.zeros_like()?)?;

        // E(2 b_h) - E(b_h) == E(b_h) - E(0) == -h·b_h
        let lhs = (doubled.energy(&v, &h)? - base.energy(&v, &h)?)?;
        let rhs = (base.energy(&v, &h)? - no_hid.energy(&v, &h)?)?;
        let diff = (&lhs - &rhs)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff = {}", diff);

        let explicit = h.broadcast_mul(&bh.unsqueeze(0)?)?.sum(1)?.neg()?;
        let err = (rhs - explicit)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err < 1e-5, "err = {}", err);
        Ok(())
    }

    #[test]
    fn coupling_scales_with_weights() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::randn(0f32, 1f32, (5, 2), &dev)?;
        let bv = Tensor::randn(0f32, 1f32, 5, &dev)?;
        let bh = Tensor::randn(0f32, 1f32, 2, &dev)?;
        let v = binary(9, 5)?;
        let h = binary(9, 2)?;

        let no_w = RbmPrior::from_tensors(w.zeros_like()?, bv.clone(), bh.clone())?;
        let base = RbmPrior::from_tensors(w.clone(), bv.clone(), bh.clone())?;
        let tripled = RbmPrior::from_tensors((&w * 3.0)?, bv, bh)?;

        let bias_only = no_w.energy(&v, &h)?;
        let coupling = (base.energy(&v, &h)? - &bias_only)?;
        let coupling_3 = (tripled.energy(&v, &h)? - &bias_only)?;

        // E - E(W = 0) = -v W hᵀ, so scaling W scales the coupling term
        let diff = (coupling_3 - (&coupling * 3.0)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-4, "diff = {}", diff);

        // and it is linear in v: doubling v on the coupling alone
        let v2 = (&v * 2.0)?;
        let coupling_v2 = (base.energy(&v2, &h)? - no_w.energy(&v2, &h)?)?;
        let diff = (coupling_v2 - (&coupling * 2.0)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-4, "diff = {}", diff);
        Ok(())
    }

    #[test]
    fn transposed_rbm_has_same_energy() -> Result<()> {
        let rbm = random_rbm(5, 3)?;
        let flipped = rbm.transposed()?;
        let v = binary(7, 5)?;
        let h = binary(7, 3)?;

        let e1: Vec<f32> = rbm.energy(&v, &h)?.to_vec1()?;
        let e2: Vec<f32> = flipped.energy(&h, &v)?.to_vec1()?;
        for (a, b) in e1.iter().zip(e2.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn energy_gradient_reaches_parameters() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let rbm = RbmPrior::new(4, 4, vs.pp("prior"))?;

        let v = binary(8, 4)?;
        let h = binary(8, 4)?;
        let loss = rbm.energy(&v, &h)?.mean_all()?;
        let grads = loss.backward()?;

        assert!(grads.get(rbm.get_weights()).is_some());
        assert!(grads.get(rbm.get_visible_bias()).is_some());
        assert!(grads.get(rbm.get_hidden_bias()).is_some());
        Ok(())
    }

    #[test]
    fn conditionals_are_detached() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let rbm = RbmPrior::new(3, 2, vs)?;

        let v = binary(4, 3)?;
        let p = rbm.hidden_given_visible(&v)?;
        let grads = p.sum_all()?.backward()?;
        assert!(grads.get(rbm.get_weights()).is_none());
        Ok(())
    }

    #[test]
    fn mismatched_layers_are_rejected() -> Result<()> {
        let rbm = random_rbm(3, 2)?;
        let v = binary(4, 3)?;
        let h = binary(4, 3)?;
        assert!(rbm.energy(&v, &h).is_err());
        Ok(())
    }
}
