//! onion-router CLI
//!
//! Runs a relay, a one-shot client proxy, or generates a relay key pair.

use clap::{Parser, Subcommand};
use onion_router::{
    logging, ClientConfig, IdentityKeyPair, OnionProxy, RelayServer, Route, RouterConfig,
    RoutersConfig, TcpTransport, ROUTER_COUNT,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "onion-router")]
#[command(about = "Minimal onion-routing relay and client proxy")]
#[command(version)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay
    Relay {
        /// Relay config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Build a circuit, send one message through it and tear it down
    Proxy {
        /// Client config file
        #[arg(short, long)]
        config: PathBuf,

        /// Router pool file
        #[arg(short, long)]
        routers: PathBuf,

        /// Destination server as addr:port
        #[arg(short, long)]
        server: Route,

        /// JSON message for the server
        #[arg(short, long)]
        message: String,

        /// Number of hops
        #[arg(long, default_value_t = ROUTER_COUNT)]
        hops: usize,

        /// Build later hops with EXTEND instead of nested CREATE
        #[arg(long)]
        extend: bool,
    },

    /// Print a fresh relay key pair
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Relay { config } => run_relay(config, cli.verbose).await?,
        Commands::Proxy {
            config,
            routers,
            server,
            message,
            hops,
            extend,
        } => run_proxy(config, routers, server, message, hops, extend, cli.verbose).await?,
        Commands::Keygen => {
            logging::init(cli.verbose);
            let identity = IdentityKeyPair::generate();
            println!("privateKey: {}", identity.secret_b64());
            println!("publicKey:  {}", identity.public_b64());
        }
    }

    Ok(())
}

async fn run_relay(path: PathBuf, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RouterConfig::load(&path)?;
    logging::init(verbose || config.verbose);

    let (identity, generated) = config.ensure_identity()?;
    if generated {
        // First run: persist the key and let the operator publish it
        config.save(&path)?;
        println!("Generated a relay key and saved it to {}", path.display());
        println!("Add this router to the pool file:");
        println!(
            "{{\"addr\": \"{}\", \"port\": {}, \"publicKey\": \"{}\"}}",
            config.addr,
            config.port,
            identity.public_b64()
        );
        return Ok(());
    }

    let transport = Arc::new(TcpTransport::default());
    let server = RelayServer::bind(&config, identity, transport).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn run_proxy(
    config: PathBuf,
    routers: PathBuf,
    server: Route,
    message: String,
    hops: usize,
    extend: bool,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load(&config)?;
    logging::init(verbose || config.verbose);

    let pool = RoutersConfig::load(&routers)?.into_pool()?;
    let payload: serde_json::Value = serde_json::from_str(&message)?;

    let transport = Arc::new(TcpTransport::default());
    let mut proxy = OnionProxy::bind(&config, &pool, hops, transport).await?;
    if extend {
        proxy.establish_with_extend().await?;
    } else {
        proxy.establish().await?;
    }

    let reply = proxy.send_data(&server, payload).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);

    proxy.destroy().await?;
    Ok(())
}
