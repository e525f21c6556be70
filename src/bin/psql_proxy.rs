//! PostgreSQL proxy that writes every client query to a log file.

use clap::Parser;
use relay::config::{CommonArgs, Config, Overrides, Service};
use relay::protocols::postgres::{self, query_log, FileWriter, QuerySink};
use relay::runtime::{Acceptor, Bus, Context, Server};
use relay::service;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "psql_proxy")]
#[command(version)]
#[command(about = "Relay PostgreSQL connections and log client queries", long_about = None)]
struct Cli {
    /// Address to listen on (default 127.0.0.1)
    host: Option<String>,

    /// Port to listen on (default 1235)
    port: Option<u16>,

    /// PostgreSQL host (default 127.0.0.1)
    target_host: Option<String>,

    /// PostgreSQL port (default 5432)
    target_port: Option<u16>,

    /// Query log file, truncated at startup (default /tmp/query.log)
    log_path: Option<PathBuf>,

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
        log_path: cli.log_path,
    };
    let config = Config::load(Service::PsqlProxy, overrides, &cli.common)?;
    service::init_tracing(&config.log_level);

    let (log, reader) = query_log(config.query_log_capacity);
    let sink: Rc<RefCell<dyn QuerySink>> = Rc::new(RefCell::new(log));

    let bus = Bus::new()?;
    let acceptor = Acceptor::bind(&bus, &config.listen, config.backlog)?;
    let upstream = config.upstream.clone();
    let server = Server::new(
        acceptor,
        Box::new(move |bus, fd, peer| {
            debug!(peer = %peer, "client connected");
            postgres::new_session(bus, fd, &upstream, sink.clone())
        }),
    );
    info!(
        service = Service::PsqlProxy.name(),
        addr = %server.local_addr(),
        upstream = %config.upstream,
        query_log = %config.query_log.display(),
        "listening"
    );

    let context = Context::with_limits(bus, Some(config.poll_timeout), config.max_events);
    service::spawn_signal_listener(context.stop_token())?;
    let writer = FileWriter::spawn(reader, &config.query_log, config.flush_interval)?;
    context.run(service::report_error);

    // The reactor has returned: nothing more can be logged.
    writer.finish()?;
    info!("shutdown complete");
    Ok(())
}
