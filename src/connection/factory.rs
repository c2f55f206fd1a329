//! Connection factory
//!
//! Creates, authenticates, and directory-positions connections for the
//! pool, including the create-on-missing fallback for the base storage
//! directory.

use log::{debug, error};
use tokio::net::TcpStream;

use crate::config::PoolConfig;
use crate::connection::FtpConnection;
use crate::error::PoolError;

/// Creates one authenticated connection positioned at the base storage
/// directory, stamped with the pool generation it belongs to.
///
/// Creation protocol: connect, read the greeting, login, switch to binary
/// transfers, probe and enable MODE Z compression, then position at the
/// base directory. If the base directory does not exist server-side it is
/// created and the directory change retried exactly once; any other fault
/// fails this creation attempt.
pub(crate) async fn create_connection(
    config: &PoolConfig,
    generation: u64,
) -> Result<FtpConnection, PoolError> {
    let addr = config.control_addr();
    let stream = TcpStream::connect(&addr).await.map_err(|e| {
        error!("Could not connect to ftp server {}: {}", addr, e);
        PoolError::Connectivity(format!("Could not connect to {}: {}", addr, e))
    })?;

    let mut conn = FtpConnection::new(stream, config.passive_mode, generation);

    let greeting = conn.read_reply().await?;
    if !greeting.is_completion() {
        return Err(greeting.into_error("connect"));
    }

    conn.login(&config.username, &config.password).await?;
    conn.expect_completion("TYPE I").await?;
    conn.enable_compression_if_supported().await?;

    position_at_base(&mut conn, &config.base_storage_dir).await?;

    debug!(
        "Created connection to {} at {}",
        addr,
        conn.current_dir()
    );
    Ok(conn)
}

/// Positions the connection at the base storage directory, creating it
/// server-side when the change fails with "not found".
async fn position_at_base(conn: &mut FtpConnection, base_dir: &str) -> Result<(), PoolError> {
    let target = if base_dir.starts_with('/') {
        base_dir.to_string()
    } else {
        let login_dir = conn.pwd().await?;
        format!("{}/{}", login_dir.trim_end_matches('/'), base_dir)
    };

    match conn.cwd(&target).await {
        Ok(()) => {}
        Err(PoolError::NotFound(_)) => {
            debug!("Base storage directory {} missing, creating it", target);
            conn.mkd(&target).await?;
            conn.cwd(&target).await?;
        }
        Err(e) => {
            error!("Could not access the base storage directory {}: {}", target, e);
            return Err(e);
        }
    }

    // Track the server-resolved form so drift checks compare like for like.
    let resolved = conn.pwd().await?;
    conn.set_current_dir(resolved);
    Ok(())
}
