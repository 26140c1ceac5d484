use clap::Parser;
use prefixd_kubernetes::controller::config::Config;

#[derive(Debug, Clone, Parser)]
pub struct ControllerCmd {
    #[arg(short = 'f', long, help = "Config file path for the prefix controller")]
    pub file: Option<String>,

    #[arg(long = "http-port", help = "HTTP server serving port")]
    pub http_port: Option<u32>,

    #[arg(
        long = "requeue-interval",
        help = "Seconds between periodic reconciliations"
    )]
    pub requeue_interval: Option<u64>,

    #[arg(
        long = "allocation-timeout",
        help = "Seconds a bound allocation may stay pending, 0 disables it"
    )]
    pub allocation_timeout: Option<u64>,

    #[arg(
        long = "backoff-initial",
        help = "Initial retry delay in seconds for failed allocations"
    )]
    pub backoff_initial: Option<u64>,

    #[arg(
        long = "backoff-max",
        help = "Maximum retry delay in seconds for failed allocations"
    )]
    pub backoff_max: Option<u64>,

    #[arg(
        long = "disable-cluster-prefix",
        help = "Do not run the ClusterPrefix controllers"
    )]
    pub disable_cluster_prefix: bool,
}

impl ControllerCmd {
    /// Flags given on the command line override the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(interval) = self.requeue_interval {
            config.requeue_interval = interval;
        }
        if let Some(timeout) = self.allocation_timeout {
            config.allocation_timeout = timeout;
        }
        if let Some(initial) = self.backoff_initial {
            config.backoff_initial = initial;
        }
        if let Some(max) = self.backoff_max {
            config.backoff_max = max;
        }
        if self.disable_cluster_prefix {
            config.enable_cluster_prefix = false;
        }
    }
}
