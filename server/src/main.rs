use clap::Parser;
use log::{error, info};

use tether_protocol::Registry;
use tether_server::args::ServerConfig;
use tether_server::modules;
use tether_server::server::Server;
use tether_server::supervisor::{set_process_title, Supervisor, WORKER_ENV};

#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Length-framed RPC server", version)]
struct Cli {
    /// Declare module to register.
    #[arg(long)]
    module: String,

    #[command(flatten)]
    config: ServerConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.config.log_level)
        .init();

    let Some(registry) = modules::load(&cli.module) else {
        eprintln!(
            "unknown module '{}', available: {}",
            cli.module,
            modules::names().join(", ")
        );
        std::process::exit(2);
    };

    if std::env::var_os(WORKER_ENV).is_some() {
        run_worker(cli, registry).await;
        return;
    }

    info!("start server on {}:{}", cli.config.host, cli.config.port);
    info!("load module '{}'", cli.module);
    let mut names: Vec<&str> = registry.names().collect();
    names.sort_unstable();
    for name in names {
        info!("  - {name}");
    }

    let title = cli.config.process_title();
    let supervisor = Supervisor::new(cli.config.worker_memory_limit, title);
    if let Err(err) = supervisor.start(cli.config.process).await {
        error!("supervisor failed: {err}");
        std::process::exit(1);
    }
}

async fn run_worker(cli: Cli, registry: Registry) {
    set_process_title(cli.config.process_title().as_deref(), false);

    let server = Server::new(cli.config, registry);
    let listener = match server.listen() {
        Ok(listener) => listener,
        Err(err) => {
            error!("bind failed: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = server.serve(listener).await {
        error!("worker [{}] got uncaught error {err}", std::process::id());
        std::process::exit(1);
    }
}
