//! The client daemon: answers the server's four remote operations over
//! plain TCP.

use anyhow::Error;
use tokio::net::TcpListener;

use bbs_client::{BackupClient, ClientConfig};
use burrow_backup::transport;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8707";

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

    let config = ClientConfig::open(ClientConfig::default_dir())?;
    let client = BackupClient::new(config);

    let listener = TcpListener::bind(&address).await?;
    log::info!("listening on {}", address);

    transport::serve(listener, client).await
}
