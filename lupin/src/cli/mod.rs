pub mod generate;
pub mod train;

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub use generate::GenerateArgs;
pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "lupin")]
#[command(about = "Discrete VAEs with RBM priors (DVAE++, GumBolt)")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a model and write its config and checkpoint
    Train(TrainArgs),
    /// Decode samples drawn from a trained model's prior
    Generate(GenerateArgs),
}

/// `{prefix}.config.json`
pub fn config_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".config.json")
}

/// `{prefix}.safetensors`
pub fn checkpoint_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".safetensors")
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn select_device(gpu: bool) -> Result<Device> {
    if gpu {
        if let Ok(dev) = Device::new_metal(0) {
            return Ok(dev);
        }
        Ok(Device::cuda_if_available(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Whitespace-delimited numeric matrix, one sample per line
pub fn read_matrix(path: &Path, device: &Device) -> Result<Tensor> {
    let reader = BufReader::new(File::open(path)?);
    let mut values: Vec<f32> = vec![];
    let mut ncol = None;
    let mut nrow = 0;

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|w| w.parse::<f32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), i + 1, e))?;

        match ncol {
            None => ncol = Some(row.len()),
            Some(n) if n != row.len() => {
                anyhow::bail!(
                    "{}:{}: expected {} columns, found {}",
                    path.display(),
                    i + 1,
                    n,
                    row.len()
                );
            }
            _ => {}
        }
        values.extend(row);
        nrow += 1;
    }

    let ncol = ncol.ok_or(anyhow::anyhow!("{} holds no data", path.display()))?;
    info!("read {} x {} from {}", nrow, ncol, path.display());
    Ok(Tensor::from_vec(values, (nrow, ncol), device)?)
}

pub fn write_matrix(path: &Path, data: &Tensor) -> Result<()> {
    let rows: Vec<Vec<f32>> = data.to_dtype(candle_core::DType::F32)?.to_vec2()?;
    let mut writer = BufWriter::new(File::create(path)?);
    for row in rows {
        let line = row
            .iter()
            .map(|v| format!("{}", v))
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;
    info!("wrote {:?} to {}", data.dims(), path.display());
    Ok(())
}
