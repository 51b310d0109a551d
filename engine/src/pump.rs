//! The tunnel pump: a dedicated thread driving packet flow between the
//! tunnel fd and the upstream socket.
//!
//! The loop polls both descriptors, drains the tunnel in bounded batches to
//! stay responsive to upstream traffic, and never blocks on a single write:
//! if the tunnel would block the packet is dropped and DNS clients
//! retransmit.

use crate::blocklog::BlockLog;
use crate::dns;
use crate::packet::{self, IP_PROTO_UDP};
use crate::rules::{Disposition, RuleTable};
use crate::tracker::{QueryRecord, QueryTracker, SWEEP_INTERVAL};
use crate::upstream::{self, UpstreamPool};
use rand::rngs::OsRng;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Max tunnel packets drained per wake.
const TUNNEL_BATCH: usize = 32;
/// Poll timeout; bounds shutdown latency and paces the tracker sweep.
const POLL_TIMEOUT_MS: libc::c_int = 250;
const READ_BUF_LEN: usize = 4096;

/// Consecutive upstream send failures inside the window that trigger a
/// reconnect.
const SEND_FAILURES_TO_RECONNECT: u32 = 3;
const SEND_FAILURE_WINDOW: Duration = Duration::from_secs(5);

/// What the pump tells the lifecycle task.
#[derive(Debug)]
pub enum PumpEvent {
    /// The loop has been entered.
    Started,
    /// First successful upstream send of this pump's life.
    UpstreamHealthy,
    /// An upstream response matched an outstanding query.
    RoundTrip,
    /// Repeated upstream send failures; the pump is exiting.
    NetworkError,
    /// The tunnel fd failed; the pump is exiting.
    FatalTunnel(String),
}

pub struct PumpConfig {
    /// Borrowed from the engine, which guarantees it outlives the thread.
    pub tun_fd: RawFd,
    pub pool: UpstreamPool,
    pub rules: Arc<RuleTable>,
    pub block_log: Option<Arc<Mutex<BlockLog>>>,
    pub ipv6_enabled: bool,
}

pub struct PumpHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PumpHandle {
    pub fn spawn(
        config: PumpConfig,
        events: mpsc::UnboundedSender<PumpEvent>,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("burrow-pump".into())
            .spawn(move || Pump::new(config, events, flag).run())?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Stop and join with a deadline. Returns false if the thread had to be
    /// abandoned; the caller then force-closes the tunnel fd.
    pub fn join_timeout(mut self, deadline: Duration) -> bool {
        self.request_stop();
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let start = Instant::now();
        while start.elapsed() < deadline {
            if thread.is_finished() {
                let _ = thread.join();
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

struct Pump {
    tun_fd: RawFd,
    pool: UpstreamPool,
    rules: Arc<RuleTable>,
    block_log: Option<Arc<Mutex<BlockLog>>>,
    ipv6_enabled: bool,
    tracker: QueryTracker,
    events: mpsc::UnboundedSender<PumpEvent>,
    shutdown: Arc<AtomicBool>,
    reported_healthy: bool,
    send_failures: u32,
    first_send_failure: Option<Instant>,
    last_sweep: Instant,
    parse_failures: u64,
    dropped: u64,
}

impl Pump {
    fn new(
        config: PumpConfig,
        events: mpsc::UnboundedSender<PumpEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tun_fd: config.tun_fd,
            pool: config.pool,
            rules: config.rules,
            block_log: config.block_log,
            ipv6_enabled: config.ipv6_enabled,
            tracker: QueryTracker::default(),
            events,
            shutdown,
            reported_healthy: false,
            send_failures: 0,
            first_send_failure: None,
            last_sweep: Instant::now(),
            parse_failures: 0,
            dropped: 0,
        }
    }

    fn run(mut self) {
        let _ = self.events.send(PumpEvent::Started);
        let upstream_fd = self.pool.as_raw_fd();
        let mut buf = [0u8; READ_BUF_LEN];

        while !self.shutdown.load(Ordering::SeqCst) {
            let mut fds = [
                libc::pollfd {
                    fd: self.tun_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: upstream_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.fatal(format!("poll failed: {err}"));
                break;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                self.fatal("tunnel fd reported error".to_string());
                break;
            }
            if fds[0].revents & libc::POLLIN != 0 {
                self.drain_tunnel(&mut buf);
            }
            if fds[1].revents & libc::POLLIN != 0 {
                self.drain_upstream(&mut buf);
            }
            self.maybe_sweep();
        }

        tracing::debug!(
            parse_failures = self.parse_failures,
            dropped = self.dropped,
            outstanding = self.tracker.len(),
            "pump exiting"
        );
    }

    /// Bounded batch so a flood of tunnel packets cannot starve upstream
    /// responses.
    fn drain_tunnel(&mut self, buf: &mut [u8]) {
        for _ in 0..TUNNEL_BATCH {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let n = unsafe { libc::read(self.tun_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        self.fatal(format!("tunnel read failed: {err}"));
                        return;
                    }
                }
            }
            if n == 0 {
                self.fatal("tunnel fd closed".to_string());
                return;
            }
            let len = n as usize;
            self.handle_tunnel_packet(buf, len);
        }
    }

    fn handle_tunnel_packet(&mut self, buf: &[u8], len: usize) {
        let pkt = &buf[..len];
        // IPv6 frames are dropped silently when the engine runs v4-only.
        if packet::ip_version(pkt) == Some(6) && !self.ipv6_enabled {
            self.dropped += 1;
            return;
        }
        let ip = match packet::parse_ip(pkt) {
            Ok(ip) => ip,
            Err(e) => {
                tracing::trace!(error = %e, "unparseable tunnel packet");
                self.parse_failures += 1;
                return;
            }
        };
        if ip.protocol != IP_PROTO_UDP {
            self.dropped += 1;
            return;
        }
        let udp = match packet::parse_udp(ip.payload) {
            Ok(udp) => udp,
            Err(e) => {
                tracing::trace!(error = %e, "unparseable udp datagram");
                self.parse_failures += 1;
                return;
            }
        };
        if udp.dst_port != dns::DNS_PORT {
            self.dropped += 1;
            return;
        }
        let question = match dns::parse_question(udp.payload) {
            Ok(q) => q,
            Err(e) => {
                tracing::trace!(error = %e, "malformed query dropped");
                self.parse_failures += 1;
                return;
            }
        };

        let client_src = SocketAddr::new(ip.src, udp.src_port);
        let client_dst = SocketAddr::new(ip.dst, udp.dst_port);

        match self.rules.lookup(&question.name) {
            Disposition::Deny => {
                tracing::debug!(name = %question.name, "query blocked");
                let response = dns::build_nxdomain(udp.payload, &question);
                self.write_tunnel_reply(client_dst, client_src, &response);
                self.log(&question.name, Disposition::Deny);
            }
            Disposition::Allow | Disposition::Ignore => {
                self.forward_query(udp.payload, &question, client_src, client_dst);
                self.log(&question.name, Disposition::Allow);
            }
        }
    }

    fn forward_query(
        &mut self,
        payload: &[u8],
        question: &dns::DnsQuestion,
        client_src: SocketAddr,
        client_dst: SocketAddr,
    ) {
        let Some(upstream_id) = upstream::pick_id(&mut OsRng, |id| self.tracker.contains(id))
        else {
            tracing::debug!("query id space exhausted, dropping query");
            self.dropped += 1;
            return;
        };
        let mut query = payload.to_vec();
        dns::rewrite_id(&mut query, upstream_id);

        match self.pool.send_query(&query) {
            Ok(resolver) => {
                self.note_send_ok();
                self.tracker.register(QueryRecord {
                    client_src,
                    client_dst,
                    client_id: question.id,
                    upstream_id,
                    resolver,
                    name: question.name.clone(),
                    sent_at: Instant::now(),
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "upstream send failed");
                self.dropped += 1;
                self.note_send_failure();
            }
        }
    }

    fn drain_upstream(&mut self, buf: &mut [u8]) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self.pool.recv(buf) {
                Ok(Some((n, from))) => {
                    self.pool.note_response(from);
                    if n < 2 {
                        self.parse_failures += 1;
                        continue;
                    }
                    let upstream_id = u16::from_be_bytes([buf[0], buf[1]]);
                    let Some(record) = self.tracker.take(upstream_id) else {
                        // Late or never-tracked response.
                        self.dropped += 1;
                        continue;
                    };
                    let _ = self.events.send(PumpEvent::RoundTrip);
                    let mut response = buf[..n].to_vec();
                    dns::rewrite_id(&mut response, record.client_id);
                    self.write_tunnel_reply(record.client_dst, record.client_src, &response);
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "upstream recv failed");
                    return;
                }
            }
        }
    }

    /// Reframe a DNS payload as an IP/UDP packet and inject it into the
    /// tunnel.
    fn write_tunnel_reply(&mut self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        let pkt = match packet::build_udp_packet(src, dst, payload) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::debug!(error = %e, "cannot frame reply");
                self.dropped += 1;
                return;
            }
        };
        loop {
            let n = unsafe { libc::write(self.tun_fd, pkt.as_ptr() as *const libc::c_void, pkt.len()) };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Backpressure: drop, the client will retransmit.
                io::ErrorKind::WouldBlock => {
                    self.dropped += 1;
                    return;
                }
                _ if err.raw_os_error() == Some(libc::EMSGSIZE) => {
                    self.dropped += 1;
                    return;
                }
                _ => {
                    self.fatal(format!("tunnel write failed: {err}"));
                    return;
                }
            }
        }
    }

    fn note_send_ok(&mut self) {
        if !self.reported_healthy {
            self.reported_healthy = true;
            let _ = self.events.send(PumpEvent::UpstreamHealthy);
        }
        self.send_failures = 0;
        self.first_send_failure = None;
    }

    fn note_send_failure(&mut self) {
        let now = Instant::now();
        match self.first_send_failure {
            Some(first) if now.duration_since(first) <= SEND_FAILURE_WINDOW => {
                self.send_failures += 1;
            }
            _ => {
                self.first_send_failure = Some(now);
                self.send_failures = 1;
            }
        }
        if self.send_failures >= SEND_FAILURES_TO_RECONNECT {
            tracing::warn!("repeated upstream send failures, requesting reconnect");
            let _ = self.events.send(PumpEvent::NetworkError);
            self.shutdown.store(true, Ordering::SeqCst);
        }
    }

    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        let now = Instant::now();
        for expired in self.tracker.sweep(now) {
            tracing::trace!(name = %expired.name, resolver = %expired.resolver, "query timed out");
            self.pool.note_timeout(expired.resolver);
        }
        self.last_sweep = now;
    }

    fn log(&mut self, name: &str, disposition: Disposition) {
        if let Some(log) = &self.block_log {
            if let Ok(mut log) = log.lock() {
                log.append(name, disposition);
            }
        }
    }

    fn fatal(&mut self, reason: String) {
        tracing::error!(%reason, "pump fatal error");
        let _ = self.events.send(PumpEvent::FatalTunnel(reason));
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
