use anyhow::{Context, Result};
use std::sync::Arc;

use ftp_fsal::config::ServerConfig;
use ftp_fsal::console::ConsoleServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    println!("FTP FSAL Console");
    println!("================");
    if let Some(root) = &config.local_root {
        println!("  Local store root: {}", root.display());
    }
    if let Some(label) = &config.tree_label {
        println!("  Provider tree:    {} (in memory)", label);
    }
    println!("  View pool cap:    {} per store", config.max_pooled_views);
    for user in &config.users {
        let perm = if user.write_permission { "rw" } else { "ro" };
        println!("  User {} -> {} store, home {} ({})", user.name, user.storage, user.home, perm);
    }
    println!();

    let factory = config
        .backend_config()
        .create_factory()
        .context("Failed to initialize backing stores")?;

    let server = ConsoleServer::new(config.listen.clone(), Arc::new(factory), config.users.clone());
    server.run().await?;

    Ok(())
}
