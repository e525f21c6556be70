//! Echo server: every byte a client sends is written back to it.

use clap::Parser;
use relay::config::{CommonArgs, Config, Overrides, Service};
use relay::protocols::echo;
use relay::runtime::{Acceptor, Bus, Context, Server};
use relay::service;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo")]
#[command(version)]
#[command(about = "Echo every byte back to the client", long_about = None)]
struct Cli {
    /// Address to listen on (default 127.0.0.1)
    host: Option<String>,

    /// Port to listen on (default 1234)
    port: Option<u16>,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let overrides = Overrides {
        host: cli.host,
        port: cli.port,
        ..Overrides::default()
    };
    let config = Config::load(Service::Echo, overrides, &cli.common)?;
    service::init_tracing(&config.log_level);

    let bus = Bus::new()?;
    let acceptor = Acceptor::bind(&bus, &config.listen, config.backlog)?;
    let server = Server::new(acceptor, Box::new(|bus, fd, _| echo::new_session(bus, fd)));
    info!(service = Service::Echo.name(), addr = %server.local_addr(), "listening");

    let context = Context::with_limits(bus, Some(config.poll_timeout), config.max_events);
    service::spawn_signal_listener(context.stop_token())?;
    context.run(service::report_error);

    info!("shutdown complete");
    Ok(())
}
