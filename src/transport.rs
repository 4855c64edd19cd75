//! Reconnecting outbound TCP stream for protocol lines.
//!
//! The queue and the socket sit behind separate locks: `enqueue` only ever
//! touches the queue, so a slow write never stalls the control loop.

use log::{debug, info, trace, warn};
use serde::Serialize;
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Mutex,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use thiserror::Error;

use crate::worker::{StopToken, Task, lock};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub retry: Duration,
    pub connect_timeout: Duration,
    pub poll: Duration,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(100),
            poll: Duration::from_millis(1),
        }
    }
}

#[derive(Debug)]
pub struct StreamTransport {
    state: AtomicU8,
    queue: Mutex<VecDeque<String>>,
    socket: Mutex<Option<TcpStream>>,
    sent: AtomicU64,
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTransport {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Disconnected as u8),
            queue: Mutex::new(VecDeque::new()),
            socket: Mutex::new(None),
            sent: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    fn set_state(&self, s: LinkState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Best-effort: queued only while connected, never retried across reconnects.
    pub fn enqueue(&self, command: impl Into<String>) -> Result<(), TransportError> {
        let mut q = lock(&self.queue);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        q.push_back(command.into());
        Ok(())
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn sent_lines(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn connect(&self, cfg: &TransportConfig) -> io::Result<()> {
        self.set_state(LinkState::Connecting);
        let res = self.try_connect(cfg);
        if res.is_err() {
            self.set_state(LinkState::Disconnected);
        }
        res
    }

    fn try_connect(&self, cfg: &TransportConfig) -> io::Result<()> {
        let mut last_err = None;
        for addr in (cfg.host.as_str(), cfg.port).to_socket_addrs()? {
            let stream = match TcpStream::connect_timeout(&addr, cfg.connect_timeout) {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;

            let mut slot = lock(&self.socket);
            *slot = Some(stream);
            // a new session starts from an empty queue
            let mut q = lock(&self.queue);
            q.clear();
            self.set_state(LinkState::Connected);
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}:{}", cfg.host, cfg.port),
            )
        }))
    }

    pub fn disconnect(&self) {
        let mut slot = lock(&self.socket);
        self.teardown(&mut slot, "closed locally");
    }

    fn teardown(&self, slot: &mut Option<TcpStream>, reason: &str) {
        let had_socket = slot.take().is_some();
        let _q = lock(&self.queue);
        if had_socket || self.is_connected() {
            info!("transport: disconnected ({reason})");
        }
        self.set_state(LinkState::Disconnected);
    }

    fn drain(&self) -> (Vec<u8>, u64) {
        let mut q = lock(&self.queue);
        let mut data = Vec::new();
        let mut lines = 0u64;
        while let Some(line) = q.pop_front() {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
            lines += 1;
        }
        (data, lines)
    }

    /// One readiness cycle: discard inbound bytes, flush the queue, idle for
    /// `poll` when there was nothing to write.
    pub fn service(&self, poll: Duration, stop: &StopToken) {
        let mut slot = lock(&self.socket);
        let Some(stream) = slot.as_mut() else {
            return;
        };

        let mut buf = [0u8; 4096];
        match stream.read(&mut buf) {
            Ok(0) => return self.teardown(&mut slot, "peer closed"),
            Ok(n) => trace!("transport: discarded {n} inbound bytes"),
            Err(e) if would_block(&e) => {}
            Err(e) => return self.teardown(&mut slot, &e.to_string()),
        }

        let (data, lines) = self.drain();
        if data.is_empty() {
            drop(slot);
            thread::sleep(poll);
            return;
        }

        let mut off = 0;
        while off < data.len() {
            if stop.is_requested() {
                debug!("transport: stop requested with {} bytes unsent", data.len() - off);
                return;
            }
            match stream.write(&data[off..]) {
                Ok(0) => return self.teardown(&mut slot, "write returned zero"),
                Ok(n) => off += n,
                Err(e) if would_block(&e) => thread::sleep(poll),
                Err(e) => return self.teardown(&mut slot, &e.to_string()),
            }
        }
        // counted only once the whole batch is on the wire
        self.sent.fetch_add(lines, Ordering::Relaxed);
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

impl Task for StreamTransport {
    type Config = TransportConfig;
    const NAME: &'static str = "transport";

    fn run(&self, cfg: TransportConfig, stop: &StopToken) -> anyhow::Result<()> {
        let mut failures = 0u32;
        while !stop.is_requested() {
            if self.is_connected() {
                self.service(cfg.poll, stop);
                continue;
            }
            match self.connect(&cfg) {
                Ok(()) => {
                    failures = 0;
                    info!("transport: connected to {}:{}", cfg.host, cfg.port);
                }
                Err(e) => {
                    if failures == 0 {
                        warn!("transport: cannot reach {}:{}: {e}; retrying", cfg.host, cfg.port);
                    } else {
                        trace!("transport: connect attempt {failures} failed: {e}");
                    }
                    failures = failures.saturating_add(1);
                    if stop.sleep(cfg.retry) {
                        break;
                    }
                }
            }
        }
        self.disconnect();
        Ok(())
    }
}
