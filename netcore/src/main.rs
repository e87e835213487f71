use std::sync::Arc;

use clap::Parser;
use netcore::config::Config;
use netcore::ping::{self, PingData};
use netcore::server::Server;
use netcore::signal;
use tokio::runtime::Builder;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, value_name = "FILE", default_value = "config.toml")]
    config: String,
}

fn main() {
    signal::init();
    pretty_env_logger::init();

    let args = Args::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("failed to load config file: {}", err);
            return;
        }
    };

    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    rt.block_on(async_main(config));
}

async fn async_main(config: Config) {
    let writeback = config.ping.writeback;
    let server = Arc::new(Server::new(config));
    ping::register(&server.conntypes, writeback, PingData::default());

    let running = {
        let server = server.clone();
        tokio::task::spawn(async move {
            if let Err(err) = server.run().await {
                tracing::error!(%err, "server exited with an error");
            }
        })
    };

    signal::SHUTDOWN.wait().await;
    let _ = running.await;

    println!("Bye");
}
