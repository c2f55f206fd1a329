//! Session leases
//!
//! A `Session` is a single-use, exclusive lease of one pooled connection.
//! It exposes the remote file and directory operations to the storage
//! backend and returns its connection to the pool exactly once, either on
//! `close()` or on drop. After close it holds no authority over the
//! connection: every further operation fails with `SessionClosed`.

use log::error;
use std::path::Path;
use tokio::sync::OwnedSemaphorePermit;

use crate::connection::FtpConnection;
use crate::error::PoolError;
use crate::pool::ConnectionPool;

struct Lease {
    conn: FtpConnection,
    permit: OwnedSemaphorePermit,
}

/// An exclusive lease of one connection, valid until `close()`.
///
/// Operations are not internally synchronized; `&mut self` receivers keep
/// a session single-caller by construction. Paths are interpreted by the
/// server relative to the session's working directory unless absolute.
pub struct Session {
    lease: Option<Lease>,
    pool: ConnectionPool,
    working_dir: String,
}

impl Session {
    pub(crate) fn new(
        conn: FtpConnection,
        permit: OwnedSemaphorePermit,
        pool: ConnectionPool,
        working_dir: String,
    ) -> Self {
        Self {
            lease: Some(Lease { conn, permit }),
            pool,
            working_dir,
        }
    }

    /// The server-side directory this session's relative paths resolve
    /// against.
    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    /// Returns the connection to the pool. Idempotent: only the first call
    /// performs the return; later calls are no-ops. Dropping an unclosed
    /// session closes it the same way.
    pub fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.return_connection(lease.conn, lease.permit);
        }
    }

    fn conn(&mut self) -> Result<&mut FtpConnection, PoolError> {
        self.lease
            .as_mut()
            .map(|lease| &mut lease.conn)
            .ok_or(PoolError::SessionClosed)
    }

    /// Creates a directory under the session working directory and
    /// returns its full path.
    pub async fn create_directory(&mut self, name: &str) -> Result<String, PoolError> {
        let path = format!("{}/{}", self.working_dir, name);
        let conn = self.conn()?;
        if let Err(e) = conn.mkd(&path).await {
            error!("Could not create directory {}: {}", path, e);
            return Err(e);
        }
        Ok(path)
    }

    /// Deletes a directory under the session working directory.
    pub async fn delete_directory(&mut self, directory: &str) -> Result<(), PoolError> {
        let path = format!("{}/{}", self.working_dir, directory);
        let conn = self.conn()?;
        if let Err(e) = conn.rmd(&path).await {
            error!("Could not delete directory {}: {}", path, e);
            return Err(e);
        }
        Ok(())
    }

    /// Renames a directory in place, keeping its parent. `old_directory`
    /// is a full path as returned by `create_directory`; the new path is
    /// returned.
    pub async fn rename_directory(
        &mut self,
        old_directory: &str,
        name: &str,
    ) -> Result<String, PoolError> {
        let parent = parent_of(old_directory);
        let new_path = match parent {
            Some(parent) => format!("{}/{}", parent, name),
            None => name.to_string(),
        };
        let conn = self.conn()?;
        if let Err(e) = conn.rename(old_directory, &new_path).await {
            error!(
                "Could not rename directory {} to {}: {}",
                old_directory, name, e
            );
            return Err(e);
        }
        Ok(new_path)
    }

    /// Uploads a local file into `directory`, returning the remote path.
    ///
    /// The underlying transport is single-directory-at-a-time: the session
    /// switches to `directory`, transfers, then restores its own working
    /// directory.
    pub async fn upload(&mut self, directory: &str, local: &Path) -> Result<String, PoolError> {
        let file_name = local_file_name(local)?;
        let restore = self.working_dir.clone();
        let conn = self.conn()?;

        let result = async {
            conn.cwd(directory).await?;
            conn.upload(&file_name, local).await?;
            conn.cwd(&restore).await
        }
        .await;

        if let Err(e) = result {
            error!("Could not upload {} to {}: {}", file_name, directory, e);
            return Err(e);
        }
        Ok(format!("{}/{}", directory, file_name))
    }

    /// Uploads a local file into `directory` under a new name, returning
    /// the remote path of the renamed file.
    pub async fn copy(
        &mut self,
        directory: &str,
        new_name: &str,
        local: &Path,
    ) -> Result<String, PoolError> {
        let file_name = local_file_name(local)?;
        let restore = self.working_dir.clone();
        let conn = self.conn()?;

        let result = async {
            conn.cwd(directory).await?;
            conn.upload(&file_name, local).await?;
            conn.rename(&file_name, new_name).await?;
            conn.cwd(&restore).await
        }
        .await;

        if let Err(e) = result {
            error!("Could not copy {} into {}: {}", new_name, directory, e);
            return Err(e);
        }
        Ok(format!("{}/{}", directory, new_name))
    }

    /// Deletes a remote file.
    pub async fn delete(&mut self, file_path: &str) -> Result<(), PoolError> {
        let conn = self.conn()?;
        if let Err(e) = conn.dele(file_path).await {
            error!("Could not delete file {}: {}", file_path, e);
            return Err(e);
        }
        Ok(())
    }

    /// Downloads a remote file into a local file.
    pub async fn retrieve(&mut self, remote_path: &str, local: &Path) -> Result<(), PoolError> {
        let conn = self.conn()?;
        if let Err(e) = conn.download(remote_path, local).await {
            error!("Could not download file {}: {}", remote_path, e);
            return Err(e);
        }
        Ok(())
    }

    /// Replaces the remote file at `file_path` with the contents of a
    /// local file: upload the new file beside the old, delete the old,
    /// rename the new into place.
    ///
    /// Not atomic: a fault between the upload and the delete/rename steps
    /// can leave both the old and the new file present. Callers must be
    /// prepared to detect and reconcile that partial state.
    pub async fn update(&mut self, file_path: &str, local: &Path) -> Result<String, PoolError> {
        let file_name = local_file_name(local)?;
        let restore = self.working_dir.clone();
        let parent = parent_of(file_path).map(str::to_string);
        let target_name = match parent.as_deref() {
            Some(parent) => &file_path[parent.len() + 1..],
            None => file_path,
        }
        .to_string();
        let conn = self.conn()?;

        let result = async {
            if let Some(parent) = parent.as_deref() {
                conn.cwd(parent).await?;
            }
            conn.upload(&file_name, local).await?;
            if file_name != target_name {
                conn.dele(&target_name).await?;
                conn.rename(&file_name, &target_name).await?;
            }
            conn.cwd(&restore).await
        }
        .await;

        if let Err(e) = result {
            error!("Could not update file {}: {}", file_path, e);
            return Err(e);
        }
        Ok(file_path.to_string())
    }

    /// Renames a remote file in place, keeping its directory. Returns the
    /// new path.
    pub async fn rename_file(
        &mut self,
        file_path: &str,
        new_name: &str,
    ) -> Result<String, PoolError> {
        let new_path = match parent_of(file_path) {
            Some(parent) => format!("{}/{}", parent, new_name),
            None => new_name.to_string(),
        };
        let conn = self.conn()?;
        if let Err(e) = conn.rename(file_path, &new_path).await {
            error!(
                "Could not rename file {} to {}: {}",
                file_path, new_name, e
            );
            return Err(e);
        }
        Ok(new_path)
    }

    /// Lists a remote directory, returning the raw listing lines. An empty
    /// path lists the session working directory.
    pub async fn list_directory(&mut self, directory: &str) -> Result<Vec<String>, PoolError> {
        let conn = self.conn()?;
        match conn.list(directory).await {
            Ok(entries) => Ok(entries),
            Err(e) => {
                error!("Could not list directory {}: {}", directory, e);
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rfind('/').map(|index| &path[..index])
}

fn local_file_name(local: &Path) -> Result<String, PoolError> {
    local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PoolError::NotFound(format!("Local file has no name: {}", local.display())))
}
