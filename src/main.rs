//! FTP storage pool - smoke entry point
//!
//! Loads the pool configuration, opens a session against the configured
//! server, and lists the base storage directory.

use log::{error, info};

use ftp_storage_pool::{ConnectionPool, PoolConfig};

#[tokio::main]
async fn main() {
    // Initialize the logger (env_logger picks up RUST_LOG environment variable)
    env_logger::init();

    let config = match PoolConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load pool configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Initializing connection pool for {}", config.control_addr());
    let pool = ConnectionPool::new(config);

    if let Err(e) = pool.initialize().await {
        error!("Pool initialization failed: {}", e);
        std::process::exit(1);
    }

    match pool.open_session().await {
        Ok(mut session) => {
            info!("Session opened at {}", session.working_dir());
            match session.list_directory("").await {
                Ok(entries) => {
                    for entry in entries {
                        println!("{}", entry);
                    }
                }
                Err(e) => error!("Failed to list base directory: {}", e),
            }
            session.close();
        }
        Err(e) => error!("Could not open session: {}", e),
    }

    pool.shutdown().await;
}
