//! UDP syslog receiver with batched database writes.

use std::net::{Ipv6Addr, SocketAddrV6, UdpSocket as StdUdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::socket::{
    bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn6,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gatewatch_core::LogRecord;
use gatewatch_enrich::Enricher;
use gatewatch_parsers::parse_log;
use gatewatch_store::Store;

use crate::SharedContext;

pub const SYSLOG_PORT: u16 = 514;
/// Max UDP payload we accept; RFC 3164 messages fit comfortably.
const BUFFER_SIZE: usize = 8192;
/// Kernel receive buffer, raised to absorb bursts.
const RECV_BUFFER_BYTES: usize = 1_048_576;
const BATCH_SIZE: usize = 50;
const BATCH_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub received: AtomicU64,
    pub parsed: AtomicU64,
    pub failed: AtomicU64,
    pub inserted: AtomicU64,
}

pub struct SyslogReceiver {
    store: Store,
    enricher: Arc<Enricher>,
    context: SharedContext,
    batch: Mutex<Vec<LogRecord>>,
    last_flush: Mutex<Instant>,
    pub stats: ReceiverStats,
}

impl SyslogReceiver {
    pub fn new(store: Store, enricher: Arc<Enricher>, context: SharedContext) -> Self {
        Self {
            store,
            enricher,
            context,
            batch: Mutex::new(Vec::with_capacity(BATCH_SIZE)),
            last_flush: Mutex::new(Instant::now()),
            stats: ReceiverStats::default(),
        }
    }

    /// Bind the dual-stack socket with a raised receive buffer.
    fn bind_socket(port: u16) -> anyhow::Result<UdpSocket> {
        let fd = socket(
            AddressFamily::Inet6,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )?;
        // Accept IPv4 as mapped addresses on the same socket
        setsockopt(&fd, sockopt::Ipv6V6Only, &false)?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        setsockopt(&fd, sockopt::RcvBuf, &RECV_BUFFER_BYTES)?;

        let addr = SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
        bind(fd.as_raw_fd(), &addr)?;

        let std_socket = unsafe { StdUdpSocket::from_raw_fd(fd.into_raw_fd()) };
        std_socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Receive loop. Blocks until the shutdown signal flips, then flushes
    /// the pending batch and closes the socket.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket = Self::bind_socket(SYSLOG_PORT)?;
        info!("Syslog receiver listening on UDP port {SYSLOG_PORT}");

        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => {
                    match result {
                        Ok(Ok((len, addr))) => {
                            self.handle_message(&buf[..len], addr).await;
                        }
                        Ok(Err(e)) => error!("Socket error: {e}"),
                        // Recv timeout: fall through to the flush check
                        Err(_) => {}
                    }
                }
            }
            self.maybe_flush().await;
        }

        info!("Stopping syslog receiver...");
        self.flush().await;
        info!(
            "Syslog receiver stopped. Stats: received={}, parsed={}, failed={}, inserted={}",
            self.stats.received.load(Ordering::Relaxed),
            self.stats.parsed.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
            self.stats.inserted.load(Ordering::Relaxed),
        );
        Ok(())
    }

    async fn handle_message(&self, data: &[u8], addr: std::net::SocketAddr) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let raw = String::from_utf8_lossy(data);
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }

        let parsed = {
            let context = self.context.read().unwrap_or_else(|e| e.into_inner());
            parse_log(raw, &context)
        };
        let Some(parsed) = parsed else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            debug!("Unparseable log from {addr}: {:.100}...", raw);
            return;
        };
        self.stats.parsed.fetch_add(1, Ordering::Relaxed);

        if let Some(learned) = parsed.learned_wan_ip {
            info!("Auto-detected WAN IP: {learned}");
            self.context
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .wan_ips
                .insert(learned);
            self.enricher.exclude_ip(learned);
        }

        let mut record = parsed.record;
        self.enricher.enrich(&mut record).await;

        let should_flush = {
            let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
            batch.push(record);
            batch.len() >= BATCH_SIZE
        };
        if should_flush {
            self.flush().await;
        }
    }

    async fn maybe_flush(&self) {
        let due = {
            let last = self.last_flush.lock().unwrap_or_else(|e| e.into_inner());
            last.elapsed() >= BATCH_TIMEOUT
        };
        if due {
            self.flush().await;
        }
    }

    /// Write the current batch. On failure the batch is dropped; a record
    /// is either in the store or gone, never retried indefinitely.
    async fn flush(&self) {
        let to_insert: Vec<LogRecord> = {
            let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *batch)
        };
        *self.last_flush.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if to_insert.is_empty() {
            return;
        }

        match self.store.insert_batch(&to_insert).await {
            Ok(inserted) => {
                self.stats.inserted.fetch_add(inserted as u64, Ordering::Relaxed);
                let dropped = to_insert.len() - inserted;
                if dropped > 0 {
                    self.stats.failed.fetch_add(dropped as u64, Ordering::Relaxed);
                }
            }
            Err(e) => {
                error!("Failed to insert batch of {} logs: {e}", to_insert.len());
                self.stats.failed.fetch_add(to_insert.len() as u64, Ordering::Relaxed);
            }
        }
    }
}
