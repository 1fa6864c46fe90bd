use crate::candle_data_loader::*;
use crate::candle_dvae_model::*;
use crate::candle_inference::TrainConfig;
use crate::candle_model_traits::{DecoderModuleT, DiscreteEncoderT};

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use std::collections::BTreeMap;

/// Receives loss reports from the training engine
pub trait TrainingMonitor {
    fn on_batch(&mut self, _epoch: usize, _batch: usize, _losses: &BTreeMap<&'static str, f32>) {}

    fn on_epoch(&mut self, _summary: &EpochSummary) {}
}

/// Reports through the `log` facade
pub struct LogMonitor {
    pub verbose: bool,
    /// every `log_every` minibatches; 0 disables batch reports
    pub log_every: usize,
}

impl LogMonitor {
    pub fn from_config(train_config: &TrainConfig) -> Self {
        Self {
            verbose: train_config.verbose,
            log_every: train_config.log_every,
        }
    }
}

impl TrainingMonitor for LogMonitor {
    fn on_batch(&mut self, epoch: usize, batch: usize, losses: &BTreeMap<&'static str, f32>) {
        if self.verbose && self.log_every > 0 && (batch + 1) % self.log_every == 0 {
            info!("[{}:{}] {}", epoch + 1, batch + 1, format_losses(losses));
        }
    }

    fn on_epoch(&mut self, summary: &EpochSummary) {
        if self.verbose {
            info!(
                "[{}] {} {}",
                summary.epoch + 1,
                if summary.train { "train" } else { "test" },
                format_losses(&summary.losses)
            );
        }
    }
}

fn format_losses(losses: &BTreeMap<&'static str, f32>) -> String {
    losses
        .iter()
        .map(|(k, v)| format!("{}: {:.4}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Refuse an update that would write NaN or inf into a parameter
fn ensure_finite_gradients(grads: &GradStore, variable_map: &VarMap) -> anyhow::Result<()> {
    let vars = variable_map
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("variable map lock: {}", e))?;

    for (name, var) in vars.iter() {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let total = grad.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            if !total.is_finite() {
                anyhow::bail!("gradient of {} is not finite ({})", name, total);
            }
        }
    }
    Ok(())
}

/// Loss components averaged over the minibatches of one epoch
#[derive(Clone, Debug)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: bool,
    pub num_batches: usize,
    pub losses: BTreeMap<&'static str, f32>,
}

/// Last evaluated minibatch with its forward result
pub struct EvaluationOutput {
    pub summary: EpochSummary,
    pub input: Tensor,
    pub conditioning: Option<Tensor>,
    pub label: Option<Tensor>,
    pub forward: ForwardOutput,
}

pub struct DvaeEngine<'a, Enc, Dec>
where
    Enc: DiscreteEncoderT,
    Dec: DecoderModuleT,
{
    pub model: &'a mut DiscreteVae<Enc, Dec>,
    pub variable_map: &'a VarMap,
    optimizer: AdamW,
    monitor: Box<dyn TrainingMonitor + 'a>,
}

impl<'a, Enc, Dec> DvaeEngine<'a, Enc, Dec>
where
    Enc: DiscreteEncoderT,
    Dec: DecoderModuleT,
{
    /// Build an engine optimizing every variable of `variable_map`
    pub fn new(
        model: &'a mut DiscreteVae<Enc, Dec>,
        variable_map: &'a VarMap,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Self> {
        let params = ParamsAdamW {
            lr: train_config.learning_rate.into(),
            ..Default::default()
        };
        let optimizer = AdamW::new(variable_map.all_vars(), params)?;

        Ok(Self {
            model,
            variable_map,
            optimizer,
            monitor: Box::new(LogMonitor::from_config(train_config)),
        })
    }

    pub fn with_monitor(mut self, monitor: Box<dyn TrainingMonitor + 'a>) -> Self {
        self.monitor = monitor;
        self
    }

    /// One pass over the data
    ///
    /// * `epoch` - epoch index used in reports
    /// * `train` - update parameters after every minibatch when true
    pub fn fit<DataL>(
        &mut self,
        epoch: usize,
        data: &mut DataL,
        train: bool,
        train_config: &TrainConfig,
    ) -> anyhow::Result<EpochSummary>
    where
        DataL: DataLoader,
    {
        Ok(self.run_epoch(epoch, data, train, train_config)?.0)
    }

    fn run_epoch<DataL>(
        &mut self,
        epoch: usize,
        data: &mut DataL,
        train: bool,
        train_config: &TrainConfig,
    ) -> anyhow::Result<(EpochSummary, Option<EvaluationOutput>)>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        data.shuffle_minibatch(train_config.batch_size)?;

        let num_batches = data.num_minibatch();
        if num_batches == 0 {
            anyhow::bail!("no minibatches to fit");
        }

        let mut loss_tot: BTreeMap<&'static str, f32> = BTreeMap::new();
        let mut last = None;

        for b in 0..num_batches {
            let mb = data.minibatch_data(b, device)?;

            let fwd = self.model.forward(&mb.input, mb.conditioning.as_ref(), train)?;
            let losses = self.model.loss(&mb.input, &fwd)?;

            if train {
                let grads = losses.loss.backward()?;
                ensure_finite_gradients(&grads, self.variable_map)?;
                self.optimizer.step(&grads)?;
            }

            let scalars = losses.scalars()?;
            for (k, v) in scalars.iter() {
                *loss_tot.entry(*k).or_insert(0.) += *v;
            }
            self.monitor.on_batch(epoch, b, &scalars);

            if b + 1 == num_batches {
                last = Some((mb, fwd));
            }
        }

        for v in loss_tot.values_mut() {
            *v /= num_batches as f32;
        }

        let summary = EpochSummary {
            epoch,
            train,
            num_batches,
            losses: loss_tot,
        };
        self.monitor.on_epoch(&summary);

        let evaluation = last.map(|(mb, forward)| EvaluationOutput {
            summary: summary.clone(),
            input: mb.input,
            conditioning: mb.conditioning,
            label: mb.label,
            forward,
        });

        Ok((summary, evaluation))
    }

    /// Train for `num_epochs`, returning one summary per epoch
    pub fn train<DataL>(
        &mut self,
        data: &mut DataL,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<EpochSummary>>
    where
        DataL: DataLoader,
    {
        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = Vec::with_capacity(train_config.num_epochs);

        for epoch in 0..train_config.num_epochs {
            let summary = self.fit(epoch, data, true, train_config)?;
            if let Some(loss) = summary.losses.get("loss") {
                pb.set_message(format!("loss: {:.4}", loss));
            }
            trace.push(summary);
            pb.inc(1);
        } // each epoch

        pb.finish_and_clear();
        Ok(trace)
    }

    /// Evaluation pass without parameter updates
    ///
    /// Returns the averaged losses and the last minibatch with its
    /// forward output.
    pub fn evaluate<DataL>(
        &mut self,
        epoch: usize,
        data: &mut DataL,
        train_config: &TrainConfig,
    ) -> anyhow::Result<EvaluationOutput>
    where
        DataL: DataLoader,
    {
        let (_, evaluation) = self.run_epoch(epoch, data, false, train_config)?;
        evaluation.ok_or(anyhow::anyhow!("evaluation produced no minibatch"))
    }

    pub fn generate_samples(
        &mut self,
        num_samples: usize,
        conditioning: Option<f64>,
    ) -> anyhow::Result<GeneratedSamples> {
        Ok(self.model.generate_samples(num_samples, conditioning)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::{ModelConfig, ModelKind};
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        batches: Rc<RefCell<usize>>,
        epochs: Rc<RefCell<Vec<f32>>>,
    }

    impl TrainingMonitor for Recorder {
        fn on_batch(&mut self, _: usize, _: usize, _: &BTreeMap<&'static str, f32>) {
            *self.batches.borrow_mut() += 1;
        }

        fn on_epoch(&mut self, summary: &EpochSummary) {
            self.epochs.borrow_mut().push(summary.losses["loss"]);
        }
    }

    fn small_model(varmap: &VarMap) -> candle_core::Result<DiscreteVae> {
        let config = ModelConfig {
            n_latent_hierarchy_lvls: 1,
            n_latent_nodes: 8,
            n_encoder_layers: 1,
            n_encoder_layer_nodes: 16,
            decoder_layers: vec![16],
            sampler_batch_size: 16,
            n_gibbs_sampling_steps: 2,
            ..ModelConfig::preset(ModelKind::DvaePp, 16)
        };
        let vs = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        DiscreteVae::new(&config, vs)
    }

    fn binary_data(n: usize) -> anyhow::Result<InMemoryData> {
        let x = Tensor::rand(0f32, 1f32, (n, 16), &Device::Cpu)?
            .ge(0.5)?
            .to_dtype(DType::F32)?;
        InMemoryData::new(&x)
    }

    #[test]
    fn monitor_sees_every_batch_and_epoch() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut model = small_model(&varmap)?;
        let mut data = binary_data(20)?;
        let train_config = TrainConfig {
            batch_size: 8,
            num_epochs: 2,
            show_progress: false,
            ..Default::default()
        };

        let batches = Rc::new(RefCell::new(0));
        let epochs = Rc::new(RefCell::new(vec![]));
        let recorder = Recorder {
            batches: batches.clone(),
            epochs: epochs.clone(),
        };

        let mut engine =
            DvaeEngine::new(&mut model, &varmap, &train_config)?.with_monitor(Box::new(recorder));
        let trace = engine.train(&mut data, &train_config)?;

        assert_eq!(trace.len(), 2);
        assert_eq!(*batches.borrow(), 6);
        assert_eq!(epochs.borrow().len(), 2);
        assert!(trace.iter().all(|s| s.losses["loss"].is_finite()));
        Ok(())
    }

    #[test]
    fn evaluation_leaves_parameters_alone() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let mut model = small_model(&varmap)?;
        let mut data = binary_data(12)?;
        let train_config = TrainConfig {
            batch_size: 5,
            show_progress: false,
            ..Default::default()
        };

        let before: Vec<Vec<f32>> = model.prior().get_weights().to_vec2()?;
        let mut engine = DvaeEngine::new(&mut model, &varmap, &train_config)?;
        let eval = engine.evaluate(0, &mut data, &train_config)?;
        assert!(!eval.summary.train);
        assert_eq!(eval.summary.num_batches, 3);
        // last chunk holds the remainder
        assert_eq!(eval.input.dims(), &[2, 16]);
        assert_eq!(eval.forward.output_data.dims(), &[2, 16]);

        let after: Vec<Vec<f32>> = engine.model.prior().get_weights().to_vec2()?;
        assert_eq!(before, after);

        engine.fit(0, &mut data, true, &train_config)?;
        let trained: Vec<Vec<f32>> = engine.model.prior().get_weights().to_vec2()?;
        assert_ne!(before, trained);
        Ok(())
    }

    #[test]
    fn sharp_mixture_training_keeps_parameters_finite() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let config = ModelConfig {
            n_latent_hierarchy_lvls: 2,
            n_latent_nodes: 4,
            n_encoder_layers: 1,
            n_encoder_layer_nodes: 16,
            decoder_layers: vec![16],
            sampler_batch_size: 16,
            n_gibbs_sampling_steps: 2,
            beta: 30.0,
            ..ModelConfig::preset(ModelKind::DvaePp, 16)
        };
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = DiscreteVae::new(&config, vs)?;
        let mut data = binary_data(32)?;
        let train_config = TrainConfig {
            batch_size: 8,
            num_epochs: 3,
            learning_rate: 1e-2,
            show_progress: false,
            ..Default::default()
        };

        let mut engine = DvaeEngine::new(&mut model, &varmap, &train_config)?;
        let trace = engine.train(&mut data, &train_config)?;
        assert!(trace.iter().all(|s| s.losses["loss"].is_finite()));

        for var in varmap.all_vars() {
            let vals: Vec<f32> = var.as_tensor().flatten_all()?.to_vec1()?;
            assert!(vals.iter().all(|v| v.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn non_finite_gradient_blocks_the_update() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vs.get_with_hints(3, "w", candle_nn::init::ZERO)?;

        // d sqrt(w) / dw is infinite at w = 0
        let grads = w.sqrt()?.sum_all()?.backward()?;
        assert!(ensure_finite_gradients(&grads, &varmap).is_err());

        let grads = (&w + 1.)?.sqrt()?.sum_all()?.backward()?;
        assert!(ensure_finite_gradients(&grads, &varmap).is_ok());
        Ok(())
    }
}
