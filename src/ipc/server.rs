use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
    thread,
    time::Duration,
};

use super::dispatch::handle_line;
use super::pipeline::Pipeline;
use super::runtime::socket_path;
use crate::config::{self, Overrides};
use crate::worker::StopToken;

const ACCEPT_IDLE: Duration = Duration::from_millis(10);

pub fn run_daemon(overrides: &Overrides) -> Result<()> {
    let (cfg, cfg_path) = config::load(overrides)?;
    info!("daemon: config {}", cfg_path.display());

    // socket
    let sock = socket_path()?;
    if sock.exists() {
        if UnixStream::connect(&sock).is_ok() {
            return Err(anyhow!("posectl daemon already running ({})", sock.display()));
        }
        let _ = fs::remove_file(&sock);
    }
    let listener =
        UnixListener::bind(&sock).with_context(|| format!("failed to bind {}", sock.display()))?;
    listener.set_nonblocking(true)?;
    info!("daemon: listening on {}", sock.display());

    // SIGINT/SIGTERM and the `shutdown` op all land on this token
    let stop = StopToken::new();
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, stop.flag())?;
    }

    let pipeline = Arc::new(Pipeline::from_config(&cfg)?);

    while !stop.is_requested() {
        match listener.accept() {
            Ok((stream, _)) => {
                let pipeline = Arc::clone(&pipeline);
                let stop = stop.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &pipeline, &stop) {
                        error!("ipc client error: {e:#}");
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_IDLE),
            Err(e) => {
                warn!("daemon: accept failed: {e}");
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }

    info!("daemon: shutting down");
    pipeline.shutdown();
    let _ = fs::remove_file(&sock);
    Ok(())
}

fn handle_client(mut stream: UnixStream, pipeline: &Pipeline, stop: &StopToken) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    debug!("ipc: {}", line.trim());
    let resp = handle_line(&line, pipeline, stop);
    writeln!(stream, "{resp}")?;
    Ok(())
}

pub fn client_request(req: serde_json::Value) -> Result<serde_json::Value> {
    let sock = socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "posectl daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(&sock)
        .with_context(|| format!("failed to connect to {}", sock.display()))?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: serde_json::Value = serde_json::from_str(&resp)?;
    Ok(v)
}
