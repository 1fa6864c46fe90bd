pub mod candle_aux_layers;
pub mod candle_checkpoint;
pub mod candle_data_loader;
pub mod candle_decoder_basic;
pub mod candle_dvae_inference;
pub mod candle_dvae_model;
pub mod candle_encoder_hierarchical;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_noise;
pub mod candle_pcd_sampler;
pub mod candle_rbm_prior;
pub mod candle_smoothing;
pub mod cli;
pub mod model_config;

pub use candle_core;
pub use candle_nn;
