use candle_core::{Result, Tensor};
use candle_nn::ops;

/// Numerically stable softplus
///
/// log(1 + exp(x)) = max(x, 0) + log(1 + exp(-|x|))
///
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1., 1.)?.log()?;
    x.relu()?.add(&tail)
}

/// Entropy of factorial Bernoulli variables given logits
///
/// H(q) = -q log q - (1 - q) log(1 - q) = softplus(l) - q l
///
/// * `logits_nk` - Bernoulli logits
///
pub fn bernoulli_entropy(logits_nk: &Tensor) -> Result<Tensor> {
    let q_nk = ops::sigmoid(logits_nk)?;
    softplus(logits_nk)?.sub(&q_nk.mul(logits_nk)?)
}

/// Bernoulli log-likelihood of binary data
///
/// llik(i) = sum_w x(i,w) * l(i,w) - softplus(l(i,w))
///
/// * `x_nd` - data tensor (observed data)
/// * `logits_nd` - logit tensor (reconstruction)
///
pub fn bernoulli_likelihood(x_nd: &Tensor, logits_nd: &Tensor) -> Result<Tensor> {
    x_nd.mul(logits_nd)?
        .sub(&softplus(logits_nd)?)?
        .sum(x_nd.rank() - 1)
}

/// Squared error of continuous deposits
///
/// err(i) = sum_w [ x(i,w) - xhat(i,w) ]^2
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - reconstruction
///
pub fn squared_error(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.sqr()?.sum(x_nd.rank() - 1)
}

/// Fail on NaN or infinite scalar values instead of training on them
pub fn ensure_finite(name: &str, value: &Tensor) -> Result<f32> {
    let v = value.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if !v.is_finite() {
        candle_core::bail!("{} is not finite ({})", name, v);
    }
    Ok(v)
}
