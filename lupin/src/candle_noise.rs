use candle_core::{Device, Result, Shape, Tensor};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

/// Seeded source of uniform draws.
///
/// Every stochastic primitive (relaxed posterior samples, Bernoulli
/// draws in the Gibbs chain, random conditioning at generation time)
/// pulls its randomness from one of these, so a fixed seed reproduces
/// the same tensors bit-for-bit on the CPU.
pub struct NoiseSource {
    rng: SmallRng,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Restart the stream from `seed`
    pub fn reseed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    /// u ~ U[0, 1) with the given shape (f32)
    pub fn uniform<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.random::<f32>())
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Independent Bernoulli draws, one per entry of `probs`
    ///
    /// * `probs` - success probabilities (any shape)
    ///
    /// Returns a {0, 1} tensor of the same shape and dtype
    pub fn bernoulli(&mut self, probs: &Tensor) -> Result<Tensor> {
        let u = self
            .uniform(probs.shape(), probs.device())?
            .to_dtype(probs.dtype())?;
        u.lt(probs)?.to_dtype(probs.dtype())
    }

    /// Draws from U[lb, ub) with the given shape (f32)
    pub fn uniform_range<S: Into<Shape>>(
        &mut self,
        shape: S,
        lb: f32,
        ub: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let unif = Uniform::new(lb, ub).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| unif.sample(&mut self.rng))
            .collect();
        Tensor::from_vec(data, shape, device)
    }
}
