use clap::Parser;
use rustipx::ppp::gre::GreTransport;
use rustipx::ppp::pptp::PptpServer;
use rustipx::qproxy::QuakeProxy;
use rustipx::server::config::{self, Config};
use rustipx::server::server::Server;
use rustipx::utils;
use rustipx::vnet::Network;
use rustipx::vnet::addressable::AddressableNetwork;
use rustipx::vnet::filter::FilterNetwork;
use rustipx::vnet::stats::StatsNetwork;
use rustipx::vnet::switch::Switch;
use rustipx::vnet::tap::TappableNetwork;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// DOSBox IPX relay server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// UDP listen address, e.g. 0.0.0.0:10000 (overrides the config file)
    #[arg(short, long)]
    listen_addr: Option<String>,

    /// Password required from uplink clients (overrides the config file)
    #[arg(long)]
    uplink_password: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = utils::init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
        return;
    }

    let mut config = match &args.config {
        Some(path) => match config::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen_addr) = args.listen_addr {
        config.server.listen_addr = listen_addr;
    }
    if let Some(password) = args.uplink_password {
        config.server.uplink_password = Some(password);
    }

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> rustipx::Result<()> {
    let cancel = CancellationToken::new();

    // The decorator stack is fixed at startup:
    // Tappable -> Stats -> Addressable -> Filter -> switch.
    // Uplink nodes skip the addressable layer, since an uplink forwards
    // for a whole remote network.
    let switch = Switch::new();
    let base: Arc<dyn Network> = if config.server.enable_netbios_filter {
        Arc::new(FilterNetwork::new(switch.clone()))
    } else {
        switch.clone()
    };
    let network: Arc<dyn Network> = Arc::new(TappableNetwork::new(Arc::new(StatsNetwork::new(
        Arc::new(AddressableNetwork::new(base.clone())),
    ))));
    let uplink_network: Arc<dyn Network> =
        Arc::new(TappableNetwork::new(Arc::new(StatsNetwork::new(base))));

    if config.pptp.enabled {
        let gre = GreTransport::open()?;
        gre.start(cancel.child_token());
        let pptp = PptpServer::new(config.pptp.listen_addr.clone(), network.clone(), gre);
        let pptp_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = pptp.run(pptp_cancel).await {
                tracing::error!("PPTP server error: {}", e);
            }
        });
    }

    for server_name in &config.qproxy.servers {
        let proxy = QuakeProxy::new(
            network.new_node(),
            server_name.clone(),
            config.qproxy.idle_timeout(),
        )?;
        let proxy_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = proxy.run(proxy_cancel).await {
                tracing::error!("Quake proxy error: {}", e);
            }
        });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            shutdown.cancel();
        }
    });

    let server = Server::new(config.server, network, uplink_network);
    server.run(cancel).await
}
