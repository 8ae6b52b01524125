use std::{net::IpAddr, path::PathBuf, process::ExitCode};

use clap::Parser;
use telekinesis::{config::Config, PeerService};

/// Telekinesis - direct peer-to-peer file and chat exchange.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file to use instead of the one in the user config directory.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Address the control API binds to.
    #[clap(long)]
    bind: Option<IpAddr>,

    /// Port the control API listens on.
    #[clap(short, long)]
    port: Option<u16>,

    /// Where received files are saved.
    #[clap(long)]
    download_dir: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(ip) = self.bind {
            config.listen_addr.set_ip(ip);
        }
        if let Some(port) = self.port {
            config.listen_addr.set_port(port);
        }
        if let Some(dir) = self.download_dir {
            config.download_dir = dir;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::new(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            log::error!("could not load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    let service = PeerService::new(config);
    let (addr, server) = match service.start().await {
        Ok(bound) => bound,
        Err(e) => {
            log::error!("could not start control API: {e}");
            service.stop().await;
            return ExitCode::FAILURE;
        }
    };
    log::info!("ready, control API at http://{addr}/api");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("interrupted, shutting down"),
        _ = server => log::warn!("control API exited"),
    }

    // closes the peer link and discards any partial download
    service.stop().await;
    ExitCode::SUCCESS
}
