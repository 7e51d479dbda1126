//! Ad-hoc control channel.
//!
//! A small thread serves a Unix domain socket with a line-oriented text
//! protocol: the client sends a command line (plus argument lines),
//! terminated by a blank line; the server answers `OK` or `ERR` followed
//! by payload lines and a blank line.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use autotier_config::Config;
use tracing::{debug, info, warn};

use crate::engine::TierEngine;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Trigger an immediate policy tick.
    Oneshot,
    /// Report per-tier fill levels.
    Status,
    /// Resolve a logical path to the tier holding it.
    WhichTier(String),
    /// Dump the loaded configuration.
    ConfigDump,
}

impl Request {
    /// Parse request lines (command first, arguments after).
    pub fn parse(lines: &[String]) -> Result<Request, String> {
        let first = lines.first().ok_or("empty request")?;
        let mut words = first.split_whitespace();
        let command = words.next().ok_or("empty request")?.to_ascii_lowercase();
        let inline_arg = words.next().map(|s| s.to_string());
        match command.as_str() {
            "oneshot" => Ok(Request::Oneshot),
            "status" => Ok(Request::Status),
            "config" => Ok(Request::ConfigDump),
            "which-tier" => {
                let arg = inline_arg
                    .or_else(|| lines.get(1).cloned())
                    .ok_or("which-tier requires a path argument")?;
                Ok(Request::WhichTier(arg))
            }
            other => Err(format!("not a command: {other}")),
        }
    }

    /// Wire form, including the terminating blank line.
    pub fn to_wire(&self) -> String {
        match self {
            Request::Oneshot => "oneshot\n\n".to_string(),
            Request::Status => "status\n\n".to_string(),
            Request::ConfigDump => "config\n\n".to_string(),
            Request::WhichTier(path) => format!("which-tier {path}\n\n"),
        }
    }
}

/// A server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub lines: Vec<String>,
}

impl Reply {
    fn ok(lines: Vec<String>) -> Self {
        Reply { ok: true, lines }
    }

    fn err(message: impl Into<String>) -> Self {
        Reply {
            ok: false,
            lines: vec![message.into()],
        }
    }

    fn to_wire(&self) -> String {
        let mut out = String::from(if self.ok { "OK\n" } else { "ERR\n" });
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Send one request and read the reply. Used by the `autotier` client.
pub fn send_request(socket: &Path, request: &Request) -> io::Result<Reply> {
    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(request.to_wire().as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut header = String::new();
    reader.read_line(&mut header)?;
    let ok = match header.trim() {
        "OK" => true,
        "ERR" => false,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed reply header: {other:?}"),
            ));
        }
    };

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            break;
        }
        lines.push(line.to_string());
    }
    Ok(Reply { ok, lines })
}

/// The control-socket server; owns the listener and the socket file.
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    engine: Arc<TierEngine>,
    config: Config,
    stop: Arc<AtomicBool>,
}

impl ControlServer {
    /// Bind the socket, replacing any stale file from a previous run.
    pub fn bind(socket_path: &Path, engine: Arc<TierEngine>, config: Config) -> io::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        info!(socket = %socket_path.display(), "control socket listening");
        Ok(ControlServer {
            listener,
            socket_path: socket_path.to_path_buf(),
            engine,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Flag the main thread sets to stop the accept loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run the accept loop on its own thread until shut down.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("autotier-control".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn control thread")
    }

    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = self.handle(stream) {
                        warn!(error = %e, "control connection failed");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "control socket accept error");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove control socket");
            }
        }
        info!("control socket closed");
    }

    fn handle(&self, stream: UnixStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            lines.push(line.to_string());
        }

        let reply = match Request::parse(&lines) {
            Ok(request) => {
                debug!(?request, "control request");
                self.dispatch(request)
            }
            Err(message) => Reply::err(message),
        };

        let mut stream = stream;
        stream.write_all(reply.to_wire().as_bytes())?;
        stream.flush()
    }

    fn dispatch(&self, request: Request) -> Reply {
        match request {
            Request::Oneshot => {
                if self.engine.request_oneshot() {
                    Reply::ok(vec!["tiering initiated".to_string()])
                } else {
                    Reply::err("autotier already tiering")
                }
            }
            Request::Status => Reply::ok(self.status_lines()),
            Request::ConfigDump => Reply::ok(
                self.config
                    .dump()
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(|l| l.to_string())
                    .collect(),
            ),
            Request::WhichTier(path) => {
                let rel = PathBuf::from(path.trim_start_matches('/'));
                match self.engine.tiers().resolve(&rel) {
                    Some(resolved) => {
                        let tier = self.engine.tiers().tier(resolved.tier_index);
                        Reply::ok(vec![tier.id().to_string()])
                    }
                    None => Reply::err(format!("no such file: {path}")),
                }
            }
        }
    }

    fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "tiering: {}",
            if self.engine.currently_tiering() {
                "yes"
            } else {
                "no"
            }
        )];
        for tier in self.engine.tiers().tiers() {
            lines.push(format!(
                "{:<16} {:>10} used / {:>10} ({:>5.1}%, watermark {}%)  {}",
                tier.id(),
                fmt_bytes(tier.used_bytes()),
                fmt_bytes(tier.capacity_bytes()),
                tier.usage_ratio() * 100.0,
                tier.watermark(),
                tier.path().display(),
            ));
        }
        lines
    }
}

/// Humanize a byte count for status output.
pub fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
