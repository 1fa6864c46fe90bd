use candle_core::{DType, Device, Tensor};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

pub struct MinibatchData {
    pub input: Tensor,
    /// side information aligned with `input`, if the data carries one
    pub conditioning: Option<Tensor>,
    pub label: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory 2d tensor. Each row will be
/// considered as a feature vector. The number of samples is the
/// number of rows.
///
pub struct InMemoryData {
    input_data: Tensor,
    conditioning_data: Option<Tensor>,
    label_data: Option<Tensor>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_conditioning_data: Option<Vec<Tensor>>,
    shuffled_label_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data` (n x d);
    /// higher ranks are flattened per sample
    ///
    pub fn new(data: &Tensor) -> anyhow::Result<Self> {
        let input_data = if data.rank() > 2 {
            data.flatten_from(1)?
        } else {
            data.clone()
        };
        let (n, _) = input_data.dims2()?;
        if n == 0 {
            anyhow::bail!("empty data");
        }

        Ok(InMemoryData {
            input_data: input_data.to_dtype(DType::F32)?,
            conditioning_data: None,
            label_data: None,
            shuffled_input_data: None,
            shuffled_conditioning_data: None,
            shuffled_label_data: None,
            minibatches: Minibatches::new(n),
        })
    }

    /// Attach per-sample conditioning (n x c, or a length-n vector)
    pub fn with_conditioning(mut self, conditioning: &Tensor) -> anyhow::Result<Self> {
        let cond = if conditioning.rank() == 1 {
            conditioning.unsqueeze(1)?
        } else {
            conditioning.clone()
        };
        self.check_rows("conditioning", &cond)?;
        self.conditioning_data = Some(cond.to_dtype(DType::F32)?);
        Ok(self)
    }

    /// Attach per-sample labels; carried along, never used by training
    pub fn with_labels(mut self, labels: &Tensor) -> anyhow::Result<Self> {
        self.check_rows("labels", labels)?;
        self.label_data = Some(labels.clone());
        Ok(self)
    }

    fn check_rows(&self, what: &str, other: &Tensor) -> anyhow::Result<()> {
        let n = self.num_samples();
        let m = other.dim(0)?;
        if m != n {
            anyhow::bail!("{} has {} rows, data has {}", what, m, n);
        }
        Ok(())
    }

    pub fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    /// Per-feature mean over all samples (d)
    pub fn feature_mean(&self) -> anyhow::Result<Tensor> {
        Ok(self.input_data.mean(0)?)
    }

    /// Restart the shuffling stream
    pub fn reseed(&mut self, seed: u64) {
        self.minibatches.rng = SmallRng::seed_from_u64(seed);
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(input) =
            take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
        {
            let conditioning = take_shuffled(
                batch_idx,
                target_device,
                self.shuffled_conditioning_data.as_ref(),
            )?;
            let label = take_shuffled(batch_idx, target_device, self.shuffled_label_data.as_ref())?;

            Ok(MinibatchData {
                input,
                conditioning,
                label,
            })
        } else {
            Err(anyhow::anyhow!("need to shuffle data"))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be > 0");
        }

        self.minibatches.shuffle_minibatch(batch_size);

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        let index_tensors = self
            .minibatches
            .chunks
            .iter()
            .map(|samples| {
                let idx: Vec<u32> = samples.iter().map(|&i| i as u32).collect();
                Tensor::from_vec(idx, samples.len(), self.input_data.device())
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        self.shuffled_input_data = Some(gather_rows(&self.input_data, &index_tensors)?);
        self.shuffled_conditioning_data = self
            .conditioning_data
            .as_ref()
            .map(|c| gather_rows(c, &index_tensors))
            .transpose()?;
        self.shuffled_label_data = self
            .label_data
            .as_ref()
            .map(|l| gather_rows(l, &index_tensors))
            .transpose()?;

        Ok(())
    }
}

fn gather_rows(data: &Tensor, index_tensors: &[Tensor]) -> anyhow::Result<Vec<Tensor>> {
    Ok(index_tensors
        .par_iter()
        .map(|idx| data.index_select(idx, 0))
        .collect::<candle_core::Result<Vec<_>>>()?)
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    rng: SmallRng,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            rng: SmallRng::seed_from_u64(0),
            chunks: vec![],
        }
    }

    /// Every sample lands in exactly one chunk; the last chunk may be
    /// shorter than `batch_size`
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        self.samples.shuffle(&mut self.rng);
        self.chunks = self
            .samples
            .par_chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}
