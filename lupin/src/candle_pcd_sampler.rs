//! Persistent contrastive divergence (PCD) sampler for the RBM prior.
//!
//! The chain is never reinitialized between calls: each
//! `block_gibbs_sampling` resumes from where the previous one stopped,
//! so the chain tracks the moving RBM parameters incrementally instead
//! of burning in from scratch at every training step.

use crate::candle_noise::NoiseSource;
use crate::candle_rbm_prior::RbmPrior;
use candle_core::{DType, Device, Result, Tensor};
use log::debug;

/// Current position of the persistent Markov chain
#[derive(Clone, Debug)]
pub struct ChainState {
    pub visible: Tensor, // batch x visible
    pub hidden: Tensor,  // batch x hidden
}

impl ChainState {
    /// All-zero chain of width `batch_size`
    pub fn zeros(batch_size: usize, rbm: &RbmPrior, device: &Device) -> Result<Self> {
        Ok(Self {
            visible: Tensor::zeros((batch_size, rbm.n_visible()), DType::F32, device)?,
            hidden: Tensor::zeros((batch_size, rbm.n_hidden()), DType::F32, device)?,
        })
    }

    /// Chain with every unit drawn from Bernoulli(0.5)
    pub fn random(
        batch_size: usize,
        rbm: &RbmPrior,
        device: &Device,
        noise: &mut NoiseSource,
    ) -> Result<Self> {
        let half_v = Tensor::full(0.5f32, (batch_size, rbm.n_visible()), device)?;
        let half_h = Tensor::full(0.5f32, (batch_size, rbm.n_hidden()), device)?;
        Ok(Self {
            visible: noise.bernoulli(&half_v)?,
            hidden: noise.bernoulli(&half_h)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.visible.dims().first().copied().unwrap_or(0)
    }
}

/// Summary statistics of the persistent chain
///
/// A chain collapsing onto all-zero or all-one states shows up as
/// activity near 0 or 1 and a drifting mean energy.
#[derive(Clone, Copy, Debug)]
pub struct ChainDiagnostics {
    pub mean_energy: f32,
    pub visible_activity: f32,
    pub hidden_activity: f32,
}

pub struct PcdSampler {
    n_gibbs_sampling_steps: usize,
    chain: ChainState,
    noise: NoiseSource,
}

impl PcdSampler {
    /// Sampler with a Bernoulli(0.5) initial chain drawn from `seed`
    ///
    /// * `rbm` - prior that fixes the chain's layer widths
    /// * `batch_size` - number of parallel chains
    /// * `n_gibbs_sampling_steps` - sweeps per `block_gibbs_sampling` call
    /// * `seed` - seed of the sampler's noise stream
    pub fn new(
        rbm: &RbmPrior,
        batch_size: usize,
        n_gibbs_sampling_steps: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut noise = NoiseSource::new(seed);
        let chain = ChainState::random(batch_size, rbm, device, &mut noise)?;
        Self::with_chain(rbm, chain, n_gibbs_sampling_steps, noise)
    }

    /// Sampler resuming from an explicit chain state
    pub fn with_chain(
        rbm: &RbmPrior,
        chain: ChainState,
        n_gibbs_sampling_steps: usize,
        noise: NoiseSource,
    ) -> Result<Self> {
        if n_gibbs_sampling_steps == 0 {
            candle_core::bail!("PCD sampler needs at least one Gibbs step per call");
        }
        check_chain(rbm, &chain)?;
        Ok(Self {
            n_gibbs_sampling_steps,
            chain,
            noise,
        })
    }

    /// Fixed chain width
    pub fn get_batch_size(&self) -> usize {
        self.chain.batch_size()
    }

    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    /// Replace the chain state (explicit reinitialization)
    ///
    /// The new state must keep the same width and layer sizes.
    pub fn reset(&mut self, rbm: &RbmPrior, chain: ChainState) -> Result<()> {
        check_chain(rbm, &chain)?;
        if chain.batch_size() != self.get_batch_size() {
            candle_core::bail!(
                "chain width {} does not match sampler width {}",
                chain.batch_size(),
                self.get_batch_size()
            );
        }
        self.chain = chain;
        Ok(())
    }

    /// Restart the sampler's noise stream
    pub fn reseed(&mut self, seed: u64) {
        self.noise.reseed(seed);
    }

    /// One conditional draw: h ~ p(h | v)
    pub fn sample_hidden(&mut self, rbm: &RbmPrior, v_nv: &Tensor) -> Result<Tensor> {
        let p_nh = rbm.hidden_given_visible(v_nv)?;
        self.noise.bernoulli(&p_nh)
    }

    /// One conditional draw: v ~ p(v | h)
    pub fn sample_visible(&mut self, rbm: &RbmPrior, h_nh: &Tensor) -> Result<Tensor> {
        let p_nv = rbm.visible_given_hidden(h_nh)?;
        self.noise.bernoulli(&p_nv)
    }

    /// Run `n_gibbs_sampling_steps` sweeps (h | v, then v | h) from the
    /// persisted chain and store the final state.
    ///
    /// Returns detached `(visible, hidden)` samples (batch x dim).
    pub fn block_gibbs_sampling(&mut self, rbm: &RbmPrior) -> Result<(Tensor, Tensor)> {
        check_chain(rbm, &self.chain)?;

        let mut v_nv = self.chain.visible.detach();
        let mut h_nh = self.chain.hidden.detach();

        for _ in 0..self.n_gibbs_sampling_steps {
            h_nh = self.sample_hidden(rbm, &v_nv)?;
            v_nv = self.sample_visible(rbm, &h_nh)?;
        }

        self.chain = ChainState {
            visible: v_nv.detach(),
            hidden: h_nh.detach(),
        };
        debug!(
            "PCD: {} sweeps over {} chains",
            self.n_gibbs_sampling_steps,
            self.get_batch_size()
        );

        Ok((v_nv.detach(), h_nh.detach()))
    }

    /// Mean energy and unit activity of the current chain
    pub fn diagnostics(&self, rbm: &RbmPrior) -> Result<ChainDiagnostics> {
        let v = self.chain.visible.detach();
        let h = self.chain.hidden.detach();
        let mean_energy = rbm.energy(&v, &h)?.detach().mean_all()?.to_scalar::<f32>()?;
        Ok(ChainDiagnostics {
            mean_energy,
            visible_activity: v.mean_all()?.to_scalar::<f32>()?,
            hidden_activity: h.mean_all()?.to_scalar::<f32>()?,
        })
    }
}

fn check_chain(rbm: &RbmPrior, chain: &ChainState) -> Result<()> {
    let (nv, dv) = chain.visible.dims2()?;
    let (nh, dh) = chain.hidden.dims2()?;
    if nv == 0 || nv != nh || dv != rbm.n_visible() || dh != rbm.n_hidden() {
        candle_core::bail!(
            "chain state {:?} / {:?} incompatible with RBM {} x {}",
            chain.visible.dims(),
            chain.hidden.dims(),
            rbm.n_visible(),
            rbm.n_hidden()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_rbm(nv: usize, nh: usize) -> Result<RbmPrior> {
        let dev = Device::Cpu;
        RbmPrior::from_tensors(
            Tensor::zeros((nv, nh), DType::F32, &dev)?,
            Tensor::zeros(nv, DType::F32, &dev)?,
            Tensor::zeros(nh, DType::F32, &dev)?,
        )
    }

    fn random_rbm(nv: usize, nh: usize) -> Result<RbmPrior> {
        let dev = Device::Cpu;
        RbmPrior::from_tensors(
            Tensor::randn(0f32, 1f32, (nv, nh), &dev)?,
            Tensor::randn(0f32, 1f32, nv, &dev)?,
            Tensor::randn(0f32, 1f32, nh, &dev)?,
        )
    }

    #[test]
    fn seeded_chains_are_reproducible() -> Result<()> {
        let rbm = random_rbm(6, 6)?;
        let dev = Device::Cpu;
        let mut s1 = PcdSampler::new(&rbm, 32, 5, 42, &dev)?;
        let mut s2 = PcdSampler::new(&rbm, 32, 5, 42, &dev)?;

        for _ in 0..3 {
            let (v1, h1) = s1.block_gibbs_sampling(&rbm)?;
            let (v2, h2) = s2.block_gibbs_sampling(&rbm)?;
            assert_eq!(v1.to_vec2::<f32>()?, v2.to_vec2::<f32>()?);
            assert_eq!(h1.to_vec2::<f32>()?, h2.to_vec2::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn chain_moves_between_calls() -> Result<()> {
        let rbm = random_rbm(8, 8)?;
        let dev = Device::Cpu;
        let mut sampler = PcdSampler::new(&rbm, 64, 1, 11, &dev)?;

        let (v1, _) = sampler.block_gibbs_sampling(&rbm)?;
        let (v2, _) = sampler.block_gibbs_sampling(&rbm)?;
        let changed = (v1 - v2)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(changed > 0.0);

        let stored: Vec<Vec<f32>> = sampler.chain().visible.to_vec2()?;
        let (v3, _) = sampler.block_gibbs_sampling(&rbm)?;
        assert_ne!(stored, v3.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn zero_rbm_samples_are_uniform() -> Result<()> {
        let rbm = zero_rbm(10, 10)?;
        let dev = Device::Cpu;
        let chain = ChainState::zeros(2000, &rbm, &dev)?;
        let mut sampler = PcdSampler::with_chain(&rbm, chain, 1, NoiseSource::new(5))?;

        for _ in 0..2 {
            let (v, h) = sampler.block_gibbs_sampling(&rbm)?;
            let v_rate = v.mean_all()?.to_scalar::<f32>()?;
            let h_rate = h.mean_all()?.to_scalar::<f32>()?;
            assert!((v_rate - 0.5).abs() < 0.03, "visible rate {}", v_rate);
            assert!((h_rate - 0.5).abs() < 0.03, "hidden rate {}", h_rate);

            let per_unit: Vec<f32> = v.mean(0)?.to_vec1()?;
            assert!(per_unit.iter().all(|r| (r - 0.5).abs() < 0.06));
        }
        Ok(())
    }

    #[test]
    fn reset_restores_chain_and_checks_width() -> Result<()> {
        let rbm = random_rbm(4, 3)?;
        let dev = Device::Cpu;
        let mut sampler = PcdSampler::new(&rbm, 16, 2, 0, &dev)?;
        sampler.block_gibbs_sampling(&rbm)?;

        sampler.reset(&rbm, ChainState::zeros(16, &rbm, &dev)?)?;
        assert_eq!(sampler.chain().visible.sum_all()?.to_scalar::<f32>()?, 0.0);

        assert!(sampler.reset(&rbm, ChainState::zeros(8, &rbm, &dev)?).is_err());
        Ok(())
    }

    #[test]
    fn zero_steps_is_a_configuration_error() -> Result<()> {
        let rbm = random_rbm(4, 3)?;
        let chain = ChainState::zeros(4, &rbm, &Device::Cpu)?;
        assert!(PcdSampler::with_chain(&rbm, chain, 0, NoiseSource::new(0)).is_err());
        Ok(())
    }

    #[test]
    fn diagnostics_report_activity() -> Result<()> {
        let rbm = zero_rbm(3, 3)?;
        let dev = Device::Cpu;
        let chain = ChainState::zeros(8, &rbm, &dev)?;
        let sampler = PcdSampler::with_chain(&rbm, chain, 1, NoiseSource::new(0))?;
        let diag = sampler.diagnostics(&rbm)?;
        assert_eq!(diag.visible_activity, 0.0);
        assert_eq!(diag.hidden_activity, 0.0);
        assert_eq!(diag.mean_energy, 0.0);
        Ok(())
    }
}
