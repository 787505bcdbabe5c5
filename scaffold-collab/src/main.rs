use env_logger::Env;
use log::info;

use scaffold_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!("Starting scaffold-collab on {}...", config.bind_addr);

    let server = CollabServer::new(config)?;
    server.run().await?;
    Ok(())
}
