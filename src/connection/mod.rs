//! FTP connection handling
//!
//! One `FtpConnection` is a single authenticated, stateful control-channel
//! connection to the remote server, bound to a server-side working
//! directory. Connections are owned exclusively by the pool while idle and
//! by exactly one session while leased; they are never shared.

pub mod factory;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::{debug, trace};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::error::PoolError;
use crate::protocol::reply::{self, Reply};

/// A single authenticated control-channel connection.
pub struct FtpConnection {
    control: BufReader<TcpStream>,
    current_dir: String,
    compression: bool,
    passive: bool,
    generation: u64,
}

impl FtpConnection {
    pub(crate) fn new(stream: TcpStream, passive: bool, generation: u64) -> Self {
        Self {
            control: BufReader::new(stream),
            current_dir: String::new(),
            compression: false,
            passive,
            generation,
        }
    }

    /// Pool generation this connection was created for. Returns from a
    /// stale generation are discarded by the pool instead of reused.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// The working directory the server currently has for this connection,
    /// as tracked from successful CWDs.
    pub(crate) fn current_dir(&self) -> &str {
        &self.current_dir
    }

    pub(crate) fn set_current_dir(&mut self, dir: String) {
        self.current_dir = dir;
    }

    /// Whether MODE Z deflate compression was negotiated at creation.
    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    async fn send_line(&mut self, line: &str) -> Result<(), PoolError> {
        if line.starts_with("PASS ") {
            trace!("--> PASS ****");
        } else {
            trace!("--> {}", line);
        }
        let stream = self.control.get_mut();
        stream.write_all(format!("{}\r\n", line).as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads one complete reply, following multiline continuation until
    /// the terminating `<code> ` line.
    pub(crate) async fn read_reply(&mut self) -> Result<Reply, PoolError> {
        let mut line = String::new();
        let n = self.control.read_line(&mut line).await?;
        if n == 0 {
            return Err(PoolError::Connectivity(
                "Connection closed by server".into(),
            ));
        }
        trace!("<-- {}", line.trim_end());

        let first = reply::parse_reply_line(&line)?;
        let code = first.code;
        let mut message = first.text.to_string();

        if !first.last {
            let terminator = format!("{} ", code);
            loop {
                line.clear();
                let n = self.control.read_line(&mut line).await?;
                if n == 0 {
                    return Err(PoolError::Connectivity(
                        "Connection closed by server mid-reply".into(),
                    ));
                }
                trace!("<-- {}", line.trim_end());
                let text = line.trim_end_matches(['\r', '\n']);
                message.push('\n');
                if let Some(rest) = text.strip_prefix(&terminator) {
                    message.push_str(rest);
                    break;
                }
                message.push_str(text);
            }
        }

        Ok(Reply::new(code, message))
    }

    /// Sends one command line and reads the complete reply.
    pub(crate) async fn command(&mut self, line: &str) -> Result<Reply, PoolError> {
        self.send_line(line).await?;
        self.read_reply().await
    }

    /// Sends a command and requires a 2xx completion reply.
    pub(crate) async fn expect_completion(&mut self, line: &str) -> Result<Reply, PoolError> {
        let reply = self.command(line).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(reply.into_error(line))
        }
    }

    /// Authenticates with USER/PASS.
    pub(crate) async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), PoolError> {
        let reply = self.command(&format!("USER {}", username)).await?;
        if reply.is_completion() {
            return Ok(());
        }
        if !reply.is_intermediate() {
            return Err(reply.into_error("USER"));
        }
        let reply = self.command(&format!("PASS {}", password)).await?;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(reply.into_error("PASS"))
        }
    }

    /// Probes FEAT for MODE Z and enables deflate compression when the
    /// server advertises it. Servers without FEAT are left uncompressed.
    pub(crate) async fn enable_compression_if_supported(&mut self) -> Result<(), PoolError> {
        let reply = self.command("FEAT").await?;
        if !reply.is_completion() {
            return Ok(());
        }
        let supported = reply
            .message
            .lines()
            .any(|line| line.trim().eq_ignore_ascii_case("MODE Z"));
        if supported {
            let reply = self.command("MODE Z").await?;
            if reply.is_completion() {
                self.compression = true;
                debug!("MODE Z compression enabled");
            }
        }
        Ok(())
    }

    /// Asks the server for the current working directory (PWD).
    pub(crate) async fn pwd(&mut self) -> Result<String, PoolError> {
        let reply = self.command("PWD").await?;
        if reply.code != reply::PATHNAME_CREATED {
            return Err(reply.into_error("PWD"));
        }
        reply::parse_created_pathname(&reply.message)
            .ok_or_else(|| PoolError::Connectivity(format!("Malformed PWD reply: {}", reply.message)))
    }

    /// Changes the server-side working directory and tracks it locally.
    pub(crate) async fn cwd(&mut self, dir: &str) -> Result<(), PoolError> {
        let reply = self.command(&format!("CWD {}", dir)).await?;
        if !reply.is_completion() {
            return Err(reply.into_error(&format!("CWD {}", dir)));
        }
        self.current_dir = dir.to_string();
        Ok(())
    }

    pub(crate) async fn mkd(&mut self, dir: &str) -> Result<(), PoolError> {
        self.expect_completion(&format!("MKD {}", dir)).await?;
        Ok(())
    }

    pub(crate) async fn rmd(&mut self, dir: &str) -> Result<(), PoolError> {
        self.expect_completion(&format!("RMD {}", dir)).await?;
        Ok(())
    }

    pub(crate) async fn dele(&mut self, path: &str) -> Result<(), PoolError> {
        self.expect_completion(&format!("DELE {}", path)).await?;
        Ok(())
    }

    /// Renames a remote file or directory via RNFR/RNTO.
    pub(crate) async fn rename(&mut self, from: &str, to: &str) -> Result<(), PoolError> {
        let reply = self.command(&format!("RNFR {}", from)).await?;
        if !reply.is_intermediate() {
            return Err(reply.into_error(&format!("RNFR {}", from)));
        }
        self.expect_completion(&format!("RNTO {}", to)).await?;
        Ok(())
    }

    /// Synchronous liveness probe: sends NOOP and reports whether the
    /// server answered. Queried at lease time, never cached.
    pub(crate) async fn is_alive(&mut self) -> bool {
        match self.command("NOOP").await {
            Ok(reply) => reply.is_completion(),
            Err(_) => false,
        }
    }

    /// Best-effort orderly shutdown; errors are ignored because the
    /// connection is being discarded either way.
    pub(crate) async fn close(mut self) {
        let _ = self.send_line("QUIT").await;
        let _ = self.read_reply().await;
    }

    /// Opens the data channel and issues the transfer verb, honoring the
    /// configured passive/active mode. Returns the connected data stream;
    /// the caller moves the bytes and then reads the final transfer reply.
    async fn open_data_channel(&mut self, verb: &str) -> Result<TcpStream, PoolError> {
        if self.passive {
            let reply = self.command("PASV").await?;
            if reply.code != reply::ENTERING_PASSIVE {
                return Err(reply.into_error(verb));
            }
            let addr = reply::parse_passive_addr(&reply.message)?;
            let stream = TcpStream::connect(SocketAddr::V4(addr)).await?;
            let reply = self.command(verb).await?;
            if !reply.is_preliminary() {
                return Err(reply.into_error(verb));
            }
            Ok(stream)
        } else {
            let local = self.control.get_ref().local_addr()?;
            let ip = match local.ip() {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => {
                    return Err(PoolError::Connectivity(
                        "Active mode requires an IPv4 control connection".into(),
                    ));
                }
            };
            let listener = TcpListener::bind(SocketAddr::new(local.ip(), 0)).await?;
            let port = listener.local_addr()?.port();
            let port_arg = reply::encode_port_addr(SocketAddrV4::new(ip, port));
            self.expect_completion(&format!("PORT {}", port_arg)).await?;
            let reply = self.command(verb).await?;
            if !reply.is_preliminary() {
                return Err(reply.into_error(verb));
            }
            let (stream, _) = listener.accept().await?;
            Ok(stream)
        }
    }

    /// Reads the post-transfer reply and requires completion.
    async fn finish_transfer(&mut self, verb: &str) -> Result<(), PoolError> {
        let reply = self.read_reply().await?;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(reply.into_error(verb))
        }
    }

    /// Uploads a local file into the current remote working directory
    /// under `remote_name` (STOR).
    pub(crate) async fn upload(
        &mut self,
        remote_name: &str,
        local: &Path,
    ) -> Result<(), PoolError> {
        let verb = format!("STOR {}", remote_name);
        let mut data = self.open_data_channel(&verb).await?;

        if self.compression {
            let bytes = tokio::fs::read(local).await?;
            let compressed = deflate(&bytes)?;
            data.write_all(&compressed).await?;
        } else {
            let mut file = tokio::fs::File::open(local).await?;
            tokio::io::copy(&mut file, &mut data).await?;
        }
        data.shutdown().await?;
        drop(data);

        self.finish_transfer(&verb).await
    }

    /// Downloads a remote file into a local file (RETR).
    pub(crate) async fn download(
        &mut self,
        remote_path: &str,
        local: &Path,
    ) -> Result<(), PoolError> {
        let verb = format!("RETR {}", remote_path);
        let mut data = self.open_data_channel(&verb).await?;

        if self.compression {
            let mut bytes = Vec::new();
            data.read_to_end(&mut bytes).await?;
            let inflated = inflate(&bytes)?;
            tokio::fs::write(local, inflated).await?;
        } else {
            let mut file = tokio::fs::File::create(local).await?;
            tokio::io::copy(&mut data, &mut file).await?;
            file.flush().await?;
        }
        drop(data);

        self.finish_transfer(&verb).await
    }

    /// Lists a remote directory (LIST), returning the raw listing lines.
    pub(crate) async fn list(&mut self, path: &str) -> Result<Vec<String>, PoolError> {
        let verb = if path.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {}", path)
        };
        let mut data = self.open_data_channel(&verb).await?;

        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes).await?;
        drop(data);
        if self.compression {
            bytes = inflate(&bytes)?;
        }

        self.finish_transfer(&verb).await?;

        let listing = String::from_utf8_lossy(&bytes);
        Ok(listing
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>, PoolError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, PoolError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
