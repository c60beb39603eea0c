use std::time::Duration;

use clap::Args;

/// Client configuration. Usable programmatically and embeddable in a clap
/// command line, where every option becomes a `--kebab-case` flag.
#[derive(Args, Clone, Debug)]
pub struct ClientConfig {
    /// Remote host.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server listen port.
    #[arg(long, default_value_t = 10050)]
    pub port: u16,

    /// Max pool size.
    #[arg(long, default_value_t = 12, value_parser = clap::value_parser!(u32).range(1..))]
    pub pool_size: u32,

    /// I/O timeout in seconds. Zero waits forever.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Retry this many times on connection errors.
    #[arg(long, default_value_t = 3)]
    pub max_retry: u32,

    /// Use the asynchronous connection pool.
    #[arg(long)]
    pub asynchronous: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10050,
            pool_size: 12,
            timeout: 300,
            max_retry: 3,
            asynchronous: false,
        }
    }
}

impl ClientConfig {
    pub(crate) fn io_timeout(&self) -> Option<Duration> {
        (self.timeout != 0).then(|| Duration::from_secs(self.timeout))
    }
}
