//! Continuous relaxations of factorial Bernoulli variables.
//!
//! A smoothing distribution r(ζ | z) turns a discrete z ~ Bernoulli(σ(l))
//! into a continuous ζ ∈ [0, 1] that can be reparameterized, so that
//! gradients reach the encoder logits `l` through the sample.

use crate::candle_loss_functions::bernoulli_entropy;
use candle_core::{Result, Tensor};
use candle_nn::ops;
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;

/// keeps ζ and q away from the boundaries of the unit interval
const BOUNDARY_EPS: f64 = 1e-6;

/// floor on the discriminant of the mixture inverse CDF
const MIN_DISCRIMINANT: f64 = 1e-30;

pub trait SmoothingDistT {
    /// Reparameterized sample given uniform noise `u_nk` ~ U(0, 1)
    fn sample(&self, u_nk: &Tensor) -> Result<Tensor>;

    /// Entropy of the factorial Bernoulli posterior, per unit (n x k)
    fn entropy(&self) -> Result<Tensor>;

    /// log r(ζ | z = 1) - log r(ζ | z = 0), per unit (n x k)
    ///
    /// Added to the logits, it turns q(z = 1) into q(z = 1 | ζ).
    fn log_ratio(&self, zeta_nk: &Tensor) -> Result<Tensor>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmootherKind {
    /// overlapping exponentials (DVAE++)
    MixtureExp,
    /// binary concrete / Gumbel-sigmoid (GumBolt)
    Gumbel,
}

impl SmootherKind {
    /// Instantiate the smoothing distribution for one hierarchy level
    pub fn build(&self, logits: &Tensor, beta: f64) -> Result<Box<dyn SmoothingDistT>> {
        if !(beta > 0.0) {
            candle_core::bail!("smoothing needs beta > 0, got {}", beta);
        }
        Ok(match self {
            SmootherKind::MixtureExp => Box::new(MixtureExp::new(logits.clone(), beta)),
            SmootherKind::Gumbel => Box::new(GumbelSigmoid::new(logits.clone(), beta)),
        })
    }
}

//////////////////////////////////////
// Mixture of overlapping exponentials
//////////////////////////////////////

/// r(ζ | 0) ∝ exp(-βζ),  r(ζ | 1) ∝ exp(β(ζ - 1)),  ζ ∈ [0, 1]
pub struct MixtureExp {
    logits: Tensor,
    beta: f64,
}

impl MixtureExp {
    pub fn new(logits: Tensor, beta: f64) -> Self {
        Self { logits, beta }
    }
}

impl SmoothingDistT for MixtureExp {
    /// Inverse CDF of the mixture (1 - q) r(ζ|0) + q r(ζ|1)
    ///
    /// With m = exp(-βζ) the CDF equation becomes m² + b m + c = 0,
    ///   b = (ρ + e^{-β}(q - ρ)) / (1 - q) - 1
    ///   c = -q e^{-β} / (1 - q)
    /// and ζ = -log(m) / β for the positive root.
    fn sample(&self, rho_nk: &Tensor) -> Result<Tensor> {
        let beta = self.beta;
        let exp_neg_beta = (-beta).exp();

        let q = ops::sigmoid(&self.logits)?.clamp(BOUNDARY_EPS, 1. - BOUNDARY_EPS)?;
        let one_minus_q = q.affine(-1., 1.)?;
        let rho = rho_nk.to_dtype(q.dtype())?;

        let b = ((rho.affine(1. - exp_neg_beta, 0.)? + q.affine(exp_neg_beta, 0.)?)?
            .div(&one_minus_q)?
            - 1.)?;
        let c = q.affine(-exp_neg_beta, 0.)?.div(&one_minus_q)?;

        // b² - 4c ≥ b² since c ≤ 0; floored so that sqrt keeps a finite
        // derivative where c underflows
        let sqrt_disc = (b.sqr()? - c.affine(4., 0.)?)?
            .maximum(MIN_DISCRIMINANT)?
            .sqrt()?;

        // Two algebraically equal forms of log m, each free of
        // cancellation on its side of b = 0:
        //   b < 0:  log((√D - b) / 2)
        //   b ≥ 0:  log(-2c) - log(b + √D),  log(-2c) = log 2 + logit(q) - β
        // Entries on the other side are replaced by one before the log,
        // so the unselected branch has no 0/0 in its backward pass.
        let b_nonneg = b.ge(0.)?;
        let ones = b.ones_like()?;
        let neg_arg = b_nonneg.where_cond(&ones, &sqrt_disc.sub(&b)?)?;
        let pos_arg = b_nonneg.where_cond(&(&b + &sqrt_disc)?, &ones)?;

        let log_m_neg = (neg_arg.log()? - LN_2)?;
        let logit_q = (q.log()? - one_minus_q.log()?)?;
        let log_m_pos = ((logit_q - pos_arg.log()?)? + (LN_2 - beta))?;
        let log_m = b_nonneg.where_cond(&log_m_pos, &log_m_neg)?;

        log_m.affine(-1. / beta, 0.)?.clamp(0., 1.)
    }

    fn entropy(&self) -> Result<Tensor> {
        bernoulli_entropy(&self.logits)
    }

    /// [β(ζ - 1)] - [-βζ] = β(2ζ - 1)
    fn log_ratio(&self, zeta_nk: &Tensor) -> Result<Tensor> {
        zeta_nk.affine(2. * self.beta, -self.beta)
    }
}

///////////////////////////
// Gumbel-sigmoid relaxation
///////////////////////////

/// ζ = σ(β (l + log u - log(1 - u)))
pub struct GumbelSigmoid {
    logits: Tensor,
    beta: f64,
}

impl GumbelSigmoid {
    pub fn new(logits: Tensor, beta: f64) -> Self {
        Self { logits, beta }
    }
}

impl SmoothingDistT for GumbelSigmoid {
    fn sample(&self, u_nk: &Tensor) -> Result<Tensor> {
        let u = u_nk
            .to_dtype(self.logits.dtype())?
            .clamp(BOUNDARY_EPS, 1. - BOUNDARY_EPS)?;
        let logistic = (u.log()? - u.affine(-1., 1.)?.log()?)?;
        ops::sigmoid(&(self.logits.add(&logistic)? * self.beta)?)
    }

    fn entropy(&self) -> Result<Tensor> {
        bernoulli_entropy(&self.logits)
    }

    /// logit(ζ) - l, so that σ(l + log_ratio) recovers ζ itself
    fn log_ratio(&self, zeta_nk: &Tensor) -> Result<Tensor> {
        let zeta = zeta_nk.clamp(BOUNDARY_EPS, 1. - BOUNDARY_EPS)?;
        let logit_zeta = (zeta.log()? - zeta.affine(-1., 1.)?.log()?)?;
        logit_zeta.sub(&self.logits)
    }
}
