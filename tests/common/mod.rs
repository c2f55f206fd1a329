//! In-process FTP server used by the integration tests.
//!
//! Implements just enough of the control and data channels to exercise the
//! pool: login, directory commands, passive and active transfers, NOOP,
//! FEAT/MODE Z, and an abrupt-disconnect switch for dead-connection tests.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use ftp_storage_pool::PoolConfig;

#[derive(Default)]
struct ServerState {
    dirs: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
    commands: Vec<String>,
    connections_accepted: usize,
}

pub struct MockFtpServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    kill_tx: broadcast::Sender<()>,
    _accept_task: JoinHandle<()>,
}

impl MockFtpServer {
    pub async fn start() -> Self {
        Self::start_inner(false, Duration::ZERO, Duration::ZERO).await
    }

    pub async fn start_with_mode_z() -> Self {
        Self::start_inner(true, Duration::ZERO, Duration::ZERO).await
    }

    /// Delays the 220 greeting, keeping connection creation in flight.
    pub async fn start_with_greeting_delay(delay: Duration) -> Self {
        Self::start_inner(false, delay, Duration::ZERO).await
    }

    /// Delays every NOOP reply, keeping keep-alive sweeps in flight.
    pub async fn start_with_slow_noop(delay: Duration) -> Self {
        Self::start_inner(false, Duration::ZERO, delay).await
    }

    async fn start_inner(mode_z: bool, greeting_delay: Duration, noop_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut state = ServerState::default();
        state.dirs.insert("/".to_string());
        let state = Arc::new(Mutex::new(state));

        let (kill_tx, _) = broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                let kill_rx = accept_kill.subscribe();
                state.lock().await.connections_accepted += 1;
                tokio::spawn(async move {
                    let _ =
                        handle_client(stream, state, kill_rx, mode_z, greeting_delay, noop_delay)
                            .await;
                });
            }
        });

        Self {
            addr,
            state,
            kill_tx,
            _accept_task: accept_task,
        }
    }

    /// Pool configuration pointing at this server. Keep-alive disabled by
    /// default; tests that need it set the field directly.
    pub fn pool_config(&self, minimum: usize, maximum: usize) -> PoolConfig {
        PoolConfig {
            host: self.addr.ip().to_string(),
            port: Some(self.addr.port()),
            username: "user".into(),
            password: "pass".into(),
            passive_mode: true,
            minimum_pool_size: minimum,
            maximum_pool_size: maximum,
            keep_alive_interval_secs: 0,
            base_storage_dir: "/storage".into(),
        }
    }

    /// Abruptly severs every established control connection. New
    /// connections are still accepted, so replacements can be created.
    pub fn drop_all_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    pub async fn connections_accepted(&self) -> usize {
        self.state.lock().await.connections_accepted
    }

    pub async fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().await.files.get(path).cloned()
    }

    pub async fn has_dir(&self, path: &str) -> bool {
        self.state.lock().await.dirs.contains(path)
    }

    pub async fn put_file(&self, path: &str, bytes: &[u8]) {
        self.state.lock().await.files.insert(path.into(), bytes.to_vec());
    }

    pub async fn remove_dir(&self, path: &str) {
        self.state.lock().await.dirs.remove(path);
    }
}

fn resolve(cwd: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else if cwd == "/" {
        format!("/{}", arg)
    } else {
        format!("{}/{}", cwd, arg)
    };
    let trimmed = joined.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn inflate(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}

struct ClientConn {
    cwd: String,
    rename_from: Option<String>,
    pasv_listener: Option<TcpListener>,
    port_target: Option<SocketAddr>,
    compress: bool,
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
    mut kill_rx: broadcast::Receiver<()>,
    mode_z: bool,
    greeting_delay: Duration,
    noop_delay: Duration,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    if !greeting_delay.is_zero() {
        tokio::time::sleep(greeting_delay).await;
    }
    reader.get_mut().write_all(b"220 Mock FTP ready\r\n").await?;

    let mut client = ClientConn {
        cwd: "/".to_string(),
        rename_from: None,
        pasv_listener: None,
        port_target: None,
        compress: false,
    };

    let mut line = String::new();
    loop {
        line.clear();
        let n = tokio::select! {
            _ = kill_rx.recv() => return Ok(()),
            result = reader.read_line(&mut line) => result?,
        };
        if n == 0 {
            return Ok(());
        }

        let trimmed = line.trim_end().to_string();
        state.lock().await.commands.push(trimmed.clone());

        let mut parts = trimmed.splitn(2, ' ');
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().unwrap_or("").trim();

        let reply = match verb.as_str() {
            "USER" => "331 Password required\r\n".to_string(),
            "PASS" => "230 Login successful\r\n".to_string(),
            "TYPE" => "200 Type set\r\n".to_string(),
            "NOOP" => {
                if !noop_delay.is_zero() {
                    tokio::time::sleep(noop_delay).await;
                }
                "200 OK\r\n".to_string()
            }
            "FEAT" => {
                if mode_z {
                    "211-Features:\r\n MODE Z\r\n211 End\r\n".to_string()
                } else {
                    "211-Features:\r\n UTF8\r\n211 End\r\n".to_string()
                }
            }
            "MODE" => {
                if mode_z && arg.eq_ignore_ascii_case("Z") {
                    client.compress = true;
                    "200 MODE Z ok\r\n".to_string()
                } else {
                    "504 Mode not supported\r\n".to_string()
                }
            }
            "PWD" => format!("257 \"{}\" is the current directory\r\n", client.cwd),
            "CWD" => {
                let path = resolve(&client.cwd, arg);
                if state.lock().await.dirs.contains(&path) {
                    client.cwd = path;
                    "250 Directory changed\r\n".to_string()
                } else {
                    "550 Directory not found\r\n".to_string()
                }
            }
            "MKD" => {
                let path = resolve(&client.cwd, arg);
                state.lock().await.dirs.insert(path.clone());
                format!("257 \"{}\" created\r\n", path)
            }
            "RMD" => {
                let path = resolve(&client.cwd, arg);
                if state.lock().await.dirs.remove(&path) {
                    "250 Directory removed\r\n".to_string()
                } else {
                    "550 Directory not found\r\n".to_string()
                }
            }
            "DELE" => {
                let path = resolve(&client.cwd, arg);
                if state.lock().await.files.remove(&path).is_some() {
                    "250 File deleted\r\n".to_string()
                } else {
                    "550 File not found\r\n".to_string()
                }
            }
            "RNFR" => {
                let path = resolve(&client.cwd, arg);
                let known = {
                    let state = state.lock().await;
                    state.files.contains_key(&path) || state.dirs.contains(&path)
                };
                if known {
                    client.rename_from = Some(path);
                    "350 Ready for destination\r\n".to_string()
                } else {
                    "550 No such file or directory\r\n".to_string()
                }
            }
            "RNTO" => match client.rename_from.take() {
                Some(from) => {
                    let to = resolve(&client.cwd, arg);
                    let mut state = state.lock().await;
                    if let Some(bytes) = state.files.remove(&from) {
                        state.files.insert(to, bytes);
                    } else if state.dirs.remove(&from) {
                        state.dirs.insert(to.clone());
                        let prefix = format!("{}/", from);
                        let moved: Vec<(String, Vec<u8>)> = state
                            .files
                            .iter()
                            .filter(|(k, _)| k.starts_with(&prefix))
                            .map(|(k, v)| {
                                (format!("{}/{}", to, &k[prefix.len()..]), v.clone())
                            })
                            .collect();
                        state.files.retain(|k, _| !k.starts_with(&prefix));
                        state.files.extend(moved);
                    }
                    "250 Rename complete\r\n".to_string()
                }
                None => "503 RNFR required first\r\n".to_string(),
            },
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                client.pasv_listener = Some(listener);
                format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                    port >> 8,
                    port & 0xff
                )
            }
            "PORT" => {
                let fields: Vec<u16> = arg
                    .split(',')
                    .filter_map(|p| p.trim().parse().ok())
                    .collect();
                if fields.len() == 6 {
                    let ip = format!(
                        "{}.{}.{}.{}",
                        fields[0], fields[1], fields[2], fields[3]
                    );
                    let port = (fields[4] << 8) | fields[5];
                    client.port_target =
                        Some(format!("{}:{}", ip, port).parse().unwrap());
                    "200 PORT ok\r\n".to_string()
                } else {
                    "501 Bad PORT argument\r\n".to_string()
                }
            }
            "LIST" => {
                let path = if arg.is_empty() {
                    client.cwd.clone()
                } else {
                    resolve(&client.cwd, arg)
                };
                let listing = {
                    let state = state.lock().await;
                    if !state.dirs.contains(&path) {
                        None
                    } else {
                        let prefix = if path == "/" {
                            "/".to_string()
                        } else {
                            format!("{}/", path)
                        };
                        let mut lines = Vec::new();
                        for dir in &state.dirs {
                            if let Some(rest) = dir.strip_prefix(&prefix) {
                                if !rest.is_empty() && !rest.contains('/') {
                                    lines.push(format!("{}/", rest));
                                }
                            }
                        }
                        for (file, bytes) in &state.files {
                            if let Some(rest) = file.strip_prefix(&prefix) {
                                if !rest.contains('/') {
                                    lines.push(format!("{}|{}", rest, bytes.len()));
                                }
                            }
                        }
                        lines.sort();
                        Some(lines.join("\r\n").into_bytes())
                    }
                };
                match listing {
                    Some(bytes) => {
                        send_data(&mut reader, &mut client, &bytes).await?;
                        continue;
                    }
                    None => "550 Directory not found\r\n".to_string(),
                }
            }
            "RETR" => {
                let path = resolve(&client.cwd, arg);
                let bytes = state.lock().await.files.get(&path).cloned();
                match bytes {
                    Some(bytes) => {
                        send_data(&mut reader, &mut client, &bytes).await?;
                        continue;
                    }
                    None => "550 File not found\r\n".to_string(),
                }
            }
            "STOR" => {
                let path = resolve(&client.cwd, arg);
                let bytes = receive_data(&mut reader, &mut client).await?;
                state.lock().await.files.insert(path, bytes);
                continue;
            }
            "QUIT" => {
                reader.get_mut().write_all(b"221 Goodbye\r\n").await?;
                return Ok(());
            }
            _ => "502 Command not implemented\r\n".to_string(),
        };

        reader.get_mut().write_all(reply.as_bytes()).await?;
    }
}

async fn open_data_stream(
    control: &mut BufReader<TcpStream>,
    client: &mut ClientConn,
) -> std::io::Result<Option<TcpStream>> {
    if let Some(listener) = client.pasv_listener.take() {
        control.get_mut().write_all(b"150 Opening data connection\r\n").await?;
        let (stream, _) = listener.accept().await?;
        return Ok(Some(stream));
    }
    if let Some(target) = client.port_target.take() {
        control.get_mut().write_all(b"150 Opening data connection\r\n").await?;
        return Ok(Some(TcpStream::connect(target).await?));
    }
    control.get_mut().write_all(b"425 Use PASV or PORT first\r\n").await?;
    Ok(None)
}

async fn send_data(
    control: &mut BufReader<TcpStream>,
    client: &mut ClientConn,
    bytes: &[u8],
) -> std::io::Result<()> {
    let compress = client.compress;
    let Some(mut stream) = open_data_stream(control, client).await? else {
        return Ok(());
    };
    let payload = if compress { deflate(bytes) } else { bytes.to_vec() };
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    drop(stream);
    control.get_mut().write_all(b"226 Transfer complete\r\n").await?;
    Ok(())
}

async fn receive_data(
    control: &mut BufReader<TcpStream>,
    client: &mut ClientConn,
) -> std::io::Result<Vec<u8>> {
    let compress = client.compress;
    let Some(mut stream) = open_data_stream(control, client).await? else {
        return Ok(Vec::new());
    };
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await?;
    drop(stream);
    control.get_mut().write_all(b"226 Transfer complete\r\n").await?;
    if compress { Ok(inflate(&bytes)) } else { Ok(bytes) }
}
