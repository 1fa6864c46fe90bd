pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
    /// report every `log_every` minibatches (0: epochs only)
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 100,
            num_epochs: 10,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
            log_every: 0,
        }
    }
}
