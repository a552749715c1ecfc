//! Binary entry point: CLI parsing, process-log initialization, and
//! signal wiring around the library's [`tftpd::server::Server`].
//!
//! The process log (started here) and the connection log (written by
//! `connlog::ConnectionLog` to `--logfile`) are deliberately separate
//! streams: this module always renders to stdout, branching only on
//! JSON vs text, and never touches `config.logfile`.

use clap::Parser;
use std::sync::Arc;
use tftpd::config::{validate_config, write_default_config, Cli, LogFormat};
use tftpd::server::Server;
use tftpd::store::MemoryStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.init_config {
        write_default_config(path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = cli.resolve()?;

    if cli.check_config {
        validate_config(&config)?;
        println!("Config OK: listening on {}", config.listen_addr());
        return Ok(());
    }

    validate_config(&config)?;

    init_logging(&config);

    tracing::info!(addr = %config.listen_addr(), "starting tftpd");

    let server = Arc::new(Server::new(config, MemoryStore::new()));
    let run_handle = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("received interrupt, draining in-flight transfers");
    server.stop().await;

    run_handle.await??;
    Ok(())
}

/// Always renders to stdout: the connection log (`--logfile`) is a
/// separate stream written by `connlog::ConnectionLog`, and this process
/// log must never share its destination.
fn init_logging(config: &tftpd::config::ServerConfig) {
    let filter = EnvFilter::new(config.verbosity.tracing_level().to_string());
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
