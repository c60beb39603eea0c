use clap::Args;
use log::LevelFilter;

/// Server configuration. Usable programmatically and embeddable in a clap
/// command line, where every option becomes a `--kebab-case` flag.
#[derive(Args, Clone, Debug)]
pub struct ServerConfig {
    /// Listen host.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port.
    #[arg(long, default_value_t = 10050)]
    pub port: u16,

    /// Listen backlog.
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..))]
    pub backlog: u32,

    /// Concurrency limit for one connection. Zero disables the cap.
    #[arg(long, default_value_t = 5)]
    pub concurrency_limit: u32,

    /// Close connections idle longer than this many seconds. Zero disables
    /// the reaper.
    #[arg(long, default_value_t = 60)]
    pub max_idle_time: u64,

    /// Worker process count.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub process: u32,

    /// Restart a worker whose resident memory exceeds this many bytes.
    /// Zero disables the check.
    #[arg(long, default_value_t = 0)]
    pub worker_memory_limit: u64,

    /// Process title.
    #[arg(long)]
    pub server_name: Option<String>,

    /// Logging level.
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10050,
            backlog: 50,
            concurrency_limit: 5,
            max_idle_time: 60,
            process: 1,
            worker_memory_limit: 0,
            server_name: None,
            log_level: LevelFilter::Info,
        }
    }
}

impl ServerConfig {
    /// The title the supervisor stamps on master and worker processes.
    pub fn process_title(&self) -> Option<String> {
        self.server_name
            .as_ref()
            .map(|name| format!("{}:{}", name, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        config: ServerConfig,
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["test"]).unwrap();
        assert_eq!(cli.config.host, "0.0.0.0");
        assert_eq!(cli.config.port, 10050);
        assert_eq!(cli.config.backlog, 50);
        assert_eq!(cli.config.concurrency_limit, 5);
        assert_eq!(cli.config.max_idle_time, 60);
        assert_eq!(cli.config.process, 1);
        assert_eq!(cli.config.worker_memory_limit, 0);
        assert_eq!(cli.config.server_name, None);
        assert_eq!(cli.config.log_level, LevelFilter::Info);
    }

    #[test]
    fn test_kebab_case_flags() {
        let cli = Cli::try_parse_from([
            "test",
            "--concurrency-limit",
            "0",
            "--max-idle-time",
            "0",
            "--worker-memory-limit",
            "1073741824",
            "--server-name",
            "test-rpc",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config.concurrency_limit, 0);
        assert_eq!(cli.config.max_idle_time, 0);
        assert_eq!(cli.config.worker_memory_limit, 1 << 30);
        assert_eq!(cli.config.process_title().as_deref(), Some("test-rpc:10050"));
        assert_eq!(cli.config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_rejects_zero_backlog_and_process() {
        assert!(Cli::try_parse_from(["test", "--backlog", "0"]).is_err());
        assert!(Cli::try_parse_from(["test", "--process", "0"]).is_err());
    }
}
