//! Host metrics reported with each pong.

use keel_core::agent::SystemMetrics;
use sysinfo::System;

pub struct MetricsSampler {
    sys: System,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
        }
    }

    pub fn sample(&mut self) -> SystemMetrics {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let load = System::load_average();
        SystemMetrics {
            cpu_percent: self.sys.global_cpu_usage() as f64,
            memory_used_bytes: self.sys.used_memory(),
            memory_total_bytes: self.sys.total_memory(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}
