//! Upstream resolver pool: one UDP socket on the underlying link, rotated
//! over the configured resolvers with per-resolver health tracking.

use rand::RngCore;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

/// Resample attempts before a query is dropped on id collision.
const MAX_ID_ATTEMPTS: usize = 8;
/// Consecutive failures inside the window that degrade a resolver.
const FAILURES_TO_DEGRADE: u32 = 3;
const FAILURE_WINDOW: Duration = Duration::from_secs(30);
/// How often a degraded resolver is handed a live query as its health
/// probe while healthy siblings exist.
const PROBE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolver {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
struct Health {
    degraded: bool,
    failures: u32,
    window_start: Option<Instant>,
    /// Last time a degraded resolver was handed a probe query.
    last_probe: Option<Instant>,
}

impl Health {
    fn note_failure(&mut self, now: Instant) {
        match self.window_start {
            Some(start) if now.duration_since(start) <= FAILURE_WINDOW => {
                self.failures += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.failures = 1;
            }
        }
        if self.failures >= FAILURES_TO_DEGRADE {
            self.degraded = true;
        }
        // A failed probe restarts the probe timer too.
        if self.degraded {
            self.last_probe = Some(now);
        }
    }

    fn note_success(&mut self) {
        self.degraded = false;
        self.failures = 0;
        self.window_start = None;
        self.last_probe = None;
    }

    fn probe_due(&self, now: Instant) -> bool {
        match self.last_probe {
            Some(last) => now.duration_since(last) >= PROBE_INTERVAL,
            None => true,
        }
    }
}

/// The engine's single upstream socket plus resolver rotation state.
///
/// The socket is explicitly bound to the underlying physical link when a
/// device name is known, so upstream traffic can never loop back into the
/// tunnel's captured default route.
pub struct UpstreamPool {
    socket: UdpSocket,
    resolvers: Vec<Resolver>,
    health: Vec<Health>,
    next: usize,
}

impl UpstreamPool {
    pub fn new(resolvers: Vec<Resolver>, bind_device: Option<&str>) -> io::Result<Self> {
        if resolvers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no upstream resolvers",
            ));
        }
        // One socket, one address family: a mixed list keeps only the first
        // resolver's family, otherwise wrong-family sends would read as
        // network failures.
        let family_v4 = resolvers[0].addr.is_ipv4();
        let before = resolvers.len();
        let resolvers: Vec<Resolver> = resolvers
            .into_iter()
            .filter(|r| r.addr.is_ipv4() == family_v4)
            .collect();
        if resolvers.len() < before {
            tracing::warn!(
                kept = resolvers.len(),
                dropped = before - resolvers.len(),
                "mixed-family resolver list, keeping the first entry's family"
            );
        }
        let bind_addr: SocketAddr = if family_v4 {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;

        if let Some(device) = bind_device {
            nix::sys::socket::setsockopt(
                &socket,
                nix::sys::socket::sockopt::BindToDevice,
                &std::ffi::OsString::from(device),
            )
            .map_err(io::Error::from)?;
            tracing::debug!(device, "upstream socket bound to underlying link");
        }

        let health = resolvers.iter().map(|_| Health::default()).collect();
        Ok(Self {
            socket,
            resolvers,
            health,
            next: 0,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Round-robin over non-degraded resolvers. A degraded resolver is
    /// still handed one query per probe interval so it can ever recover;
    /// when every resolver is degraded the next one in rotation is returned
    /// and the query doubles as its probe.
    fn next_resolver(&mut self) -> (usize, SocketAddr) {
        let now = Instant::now();
        let n = self.resolvers.len();
        for offset in 0..n {
            let idx = (self.next + offset) % n;
            if self.health[idx].degraded && self.health[idx].probe_due(now) {
                self.health[idx].last_probe = Some(now);
                self.next = (idx + 1) % n;
                return (idx, self.resolvers[idx].addr);
            }
        }
        for offset in 0..n {
            let idx = (self.next + offset) % n;
            if !self.health[idx].degraded {
                self.next = (idx + 1) % n;
                return (idx, self.resolvers[idx].addr);
            }
        }
        let idx = self.next % n;
        self.next = (idx + 1) % n;
        (idx, self.resolvers[idx].addr)
    }

    /// Send one query towards the next resolver. Returns the resolver
    /// address the query went to.
    pub fn send_query(&mut self, query: &[u8]) -> io::Result<SocketAddr> {
        let (idx, addr) = self.next_resolver();
        match self.socket.send_to(query, addr) {
            Ok(_) => Ok(addr),
            Err(e) => {
                self.health[idx].note_failure(Instant::now());
                Err(e)
            }
        }
    }

    /// Drain one datagram from the upstream socket; `None` when it would
    /// block.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A response (or probe answer) arrived from this resolver.
    pub fn note_response(&mut self, from: SocketAddr) {
        if let Some(idx) = self.resolvers.iter().position(|r| r.addr == from) {
            self.health[idx].note_success();
        }
    }

    /// A tracked query to this resolver expired without an answer.
    pub fn note_timeout(&mut self, resolver: SocketAddr) {
        if let Some(idx) = self.resolvers.iter().position(|r| r.addr == resolver) {
            self.health[idx].note_failure(Instant::now());
        }
    }

    pub fn is_degraded(&self, resolver: SocketAddr) -> bool {
        self.resolvers
            .iter()
            .position(|r| r.addr == resolver)
            .is_some_and(|idx| self.health[idx].degraded)
    }
}

/// Sample a fresh 16-bit query id, resampling on collision with an
/// outstanding id. Gives up after a bounded number of attempts.
pub fn pick_id<R: RngCore>(rng: &mut R, mut in_use: impl FnMut(u16) -> bool) -> Option<u16> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = rng.next_u32() as u16;
        if !in_use(id) {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn resolvers(n: usize) -> Vec<Resolver> {
        (0..n)
            .map(|i| Resolver {
                name: format!("r{i}"),
                addr: format!("192.0.2.{}:53", i + 1).parse().unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut pool = UpstreamPool::new(resolvers(3), None).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| pool.next_resolver().0).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_degraded_resolver_skipped() {
        let mut pool = UpstreamPool::new(resolvers(3), None).unwrap();
        let addr = pool.resolvers[1].addr;
        let now = Instant::now();
        for _ in 0..3 {
            pool.health[1].note_failure(now);
        }
        assert!(pool.is_degraded(addr));

        // Freshly degraded: no probe due yet, rotation skips it.
        let picks: Vec<usize> = (0..4).map(|_| pool.next_resolver().0).collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);

        // A successful response restores it to the rotation.
        pool.note_response(addr);
        assert!(!pool.is_degraded(addr));
        let picks: Vec<usize> = (0..3).map(|_| pool.next_resolver().0).collect();
        assert!(picks.contains(&1));
    }

    #[test]
    fn test_degraded_resolver_probed_in_rotation() {
        let mut pool = UpstreamPool::new(resolvers(2), None).unwrap();
        let addr = pool.resolvers[1].addr;
        let now = Instant::now();
        for _ in 0..3 {
            pool.health[1].note_failure(now);
        }
        assert_eq!(pool.next_resolver().0, 0);
        assert_eq!(pool.next_resolver().0, 0);

        // Once the interval elapses the degraded entry gets one live query
        // as its probe, even though a healthy sibling exists.
        pool.health[1].last_probe = Some(now - PROBE_INTERVAL);
        assert_eq!(pool.next_resolver().0, 1, "degraded resolver must be probed");

        // The probe is rate limited, not repeated every rotation.
        assert_eq!(pool.next_resolver().0, 0);
        assert_eq!(pool.next_resolver().0, 0);

        // The probe answer is what restores it.
        pool.note_response(addr);
        assert!(!pool.is_degraded(addr));
        let picks: Vec<usize> = (0..2).map(|_| pool.next_resolver().0).collect();
        assert!(picks.contains(&1));
    }

    #[test]
    fn test_failed_probe_restarts_probe_timer() {
        let mut pool = UpstreamPool::new(resolvers(2), None).unwrap();
        let addr = pool.resolvers[1].addr;
        let now = Instant::now();
        for _ in 0..3 {
            pool.health[1].note_failure(now);
        }
        pool.health[1].last_probe = Some(now - PROBE_INTERVAL);
        assert_eq!(pool.next_resolver().0, 1);

        // The probe timed out; the resolver stays degraded and is not
        // probed again until another interval passes.
        pool.note_timeout(addr);
        assert!(pool.is_degraded(addr));
        assert_eq!(pool.next_resolver().0, 0);
        assert_eq!(pool.next_resolver().0, 0);
    }

    #[test]
    fn test_mixed_family_list_keeps_first_family() {
        let mut list = resolvers(2);
        list.insert(
            1,
            Resolver {
                name: "v6".into(),
                addr: "[2001:db8::1]:53".parse().unwrap(),
            },
        );
        let mut pool = UpstreamPool::new(list, None).unwrap();
        assert_eq!(pool.resolvers.len(), 2);
        assert!(pool.resolvers.iter().all(|r| r.addr.is_ipv4()));
        let picks: Vec<SocketAddr> = (0..4).map(|_| pool.next_resolver().1).collect();
        assert!(picks.iter().all(|a| a.is_ipv4()));
    }

    #[test]
    fn test_all_degraded_still_yields_probe_target() {
        let mut pool = UpstreamPool::new(resolvers(2), None).unwrap();
        let now = Instant::now();
        for h in &mut pool.health {
            for _ in 0..3 {
                h.note_failure(now);
            }
        }
        let (idx, _) = pool.next_resolver();
        assert!(idx < 2);
    }

    #[test]
    fn test_failures_outside_window_do_not_degrade() {
        let mut health = Health::default();
        let base = Instant::now();
        health.note_failure(base);
        health.note_failure(base + Duration::from_secs(31));
        health.note_failure(base + Duration::from_secs(32));
        assert!(!health.degraded, "window restarted after the gap");
        health.note_failure(base + Duration::from_secs(33));
        assert!(health.degraded);
    }

    #[test]
    fn test_pick_id_avoids_outstanding() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = pick_id(&mut rng, |_| false).unwrap();
        let next = pick_id(&mut rng, |candidate| candidate == id);
        assert_ne!(next, Some(id));
    }

    #[test]
    fn test_pick_id_gives_up_when_space_exhausted() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pick_id(&mut rng, |_| true), None);
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(UpstreamPool::new(vec![], None).is_err());
    }
}
