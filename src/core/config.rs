use crate::core::errors::{BeamlineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cluster configuration: fabric sizing plus render-scheduling defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    // Fabric
    /// Number of worker processes to launch
    pub workers: usize,
    /// Capacity of the broadcast command channel (backpressure bound)
    pub channel_capacity: usize,
    /// Capacity of each worker's report channel
    pub report_capacity: usize,

    // Render scheduling
    /// Start with the dynamic tile scheduler (render runs as a spawned task);
    /// false selects static inline rendering
    pub dynamic_load_balancer: bool,
    /// Tile slots the coordinator preallocates for itself during assembly
    pub prealloc_tiles: u32,
    /// Concurrent shading tasks per worker under the dynamic scheduler
    pub shading_tasks: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let cpu_count = num_cpus::get();

        Self {
            workers: 2,
            channel_capacity: 64,
            report_capacity: 16,
            dynamic_load_balancer: true,
            prealloc_tiles: 4,
            shading_tasks: cpu_count.min(8),
        }
    }
}

impl ClusterConfig {
    /// Load a configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(BeamlineError::configuration(
                "channel_capacity must be greater than 0",
            ));
        }
        if self.report_capacity == 0 {
            return Err(BeamlineError::configuration(
                "report_capacity must be greater than 0",
            ));
        }
        if self.shading_tasks == 0 {
            return Err(BeamlineError::configuration(
                "shading_tasks must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the broadcast channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Select the static scheduler (render completes inline in dispatch order)
    pub fn with_static_scheduler(mut self) -> Self {
        self.dynamic_load_balancer = false;
        self
    }

    /// Set the shading task pool size
    pub fn with_shading_tasks(mut self, tasks: usize) -> Self {
        self.shading_tasks = tasks;
        self
    }
}
