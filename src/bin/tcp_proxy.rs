//! Transparent TCP proxy: each client is relayed to a fixed upstream.

use clap::Parser;
use relay::config::{CommonArgs, Config, Overrides, Service};
use relay::protocols::proxy;
use relay::runtime::{Acceptor, Bus, Context, Server};
use relay::service;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "tcp_proxy")]
#[command(version)]
#[command(about = "Relay TCP connections to an upstream server", long_about = None)]
struct Cli {
    /// Address to listen on (default 127.0.0.1)
    host: Option<String>,

    /// Port to listen on (default 1234)
    port: Option<u16>,

    /// Upstream host (default 127.0.0.1)
    target_host: Option<String>,

    /// Upstream port (default 5432)
    target_port: Option<u16>,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let overrides = Overrides {
        host: cli.host,
        port: cli.port,
        target_host: cli.target_host,
        target_port: cli.target_port,
        ..Overrides::default()
    };
    let config = Config::load(Service::TcpProxy, overrides, &cli.common)?;
    service::init_tracing(&config.log_level);

    let bus = Bus::new()?;
    let acceptor = Acceptor::bind(&bus, &config.listen, config.backlog)?;
    let upstream = config.upstream.clone();
    let server = Server::new(
        acceptor,
        Box::new(move |bus, fd, peer| {
            debug!(peer = %peer, "client connected");
            proxy::new_session(bus, fd, &upstream)
        }),
    );
    info!(
        service = Service::TcpProxy.name(),
        addr = %server.local_addr(),
        upstream = %config.upstream,
        "listening"
    );

    let context = Context::with_limits(bus, Some(config.poll_timeout), config.max_events);
    service::spawn_signal_listener(context.stop_token())?;
    context.run(service::report_error);

    info!("shutdown complete");
    Ok(())
}
