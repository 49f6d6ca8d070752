use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::info;

use std::sync::Arc;

use aerospike::{Client, ClientPolicy};

use aredis::server::Server;
use aredis::store::Context;

/// RESP gateway mapping Redis commands onto an Aerospike record store.
#[derive(Parser, Debug)]
#[clap(version, long_about = None)]
struct Args {
    /// Address to listen on for RESP clients
    #[clap(long, default_value = "localhost:6379")]
    listen: String,

    /// Aerospike server host
    #[clap(long, default_value = "localhost")]
    aero_host: String,

    /// Aerospike server port
    #[clap(long, default_value_t = 3000)]
    aero_port: u16,

    /// Namespace the gateway's records live in
    #[clap(long, default_value = "test")]
    ns: String,

    /// Set the gateway's records live in
    #[clap(long, default_value = "redis")]
    set: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let hosts = format!("{}:{}", args.aero_host, args.aero_port);
    let client = Client::new(&ClientPolicy::default(), &hosts)
        .map_err(|err| eyre!("connecting to aerospike at {hosts}: {err}"))?;
    info!("connected to aerospike at {hosts}");

    let ctx = Context::new(Arc::new(client), args.ns, args.set);
    Server::new(ctx, args.listen).start()?;
    Ok(())
}
