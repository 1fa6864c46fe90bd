use super::*;
use crate::candle_checkpoint::load_checkpoint;
use crate::candle_dvae_model::DiscreteVae;
use crate::model_config::ModelConfig;
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Args;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Prefix given to `train --out`
    #[arg(short, long)]
    pub model: PathBuf,

    /// Generated outputs, one sample per line
    #[arg(short, long)]
    pub out: PathBuf,

    #[arg(short, long, default_value_t = 64)]
    pub num_samples: usize,

    /// Fixed conditioning value for conditioned models; drawn
    /// uniformly when omitted
    #[arg(long)]
    pub conditioning: Option<f64>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = false)]
    pub gpu: bool,
}

pub fn run(args: &GenerateArgs) -> Result<()> {
    let device = select_device(args.gpu)?;
    let config = ModelConfig::from_json_file(config_path(&args.model))?;

    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = DiscreteVae::new(&config, vs)?;
    load_checkpoint(checkpoint_path(&args.model), &varmap, &mut model)?;
    model.reseed(args.seed);

    let generated = model.generate_samples(args.num_samples, args.conditioning)?;
    write_matrix(&args.out, &generated.outputs)?;

    if let Some(cond) = generated.conditioning {
        let cond_path = with_suffix(&args.out, ".conditioning");
        write_matrix(&cond_path, &cond)?;
    }
    Ok(())
}
