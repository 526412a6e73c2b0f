//! Network configuration.

/// Settings fixed when a [`Network`](crate::Network) is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Log each layer's output summary during Forward sweeps.
    pub forward_trace: bool,
    /// Log each layer's gradient summary during Backward sweeps.
    pub backward_trace: bool,
    /// Log channel partitions when Concat/Split move data.
    pub concat_trace: bool,
    /// Seed for weight initialisation and dropout masks.
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            forward_trace: false,
            backward_trace: false,
            concat_trace: false,
            seed: 0x5eed,
        }
    }
}

impl NetworkConfig {
    /// Creates a new NetworkConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward_trace(mut self, on: bool) -> Self {
        self.forward_trace = on;
        self
    }

    pub fn backward_trace(mut self, on: bool) -> Self {
        self.backward_trace = on;
        self
    }

    pub fn concat_trace(mut self, on: bool) -> Self {
        self.concat_trace = on;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
