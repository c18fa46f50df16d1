//! A per-origin idle connection cache with host and global capacity
//! limits, idle expiration, and a background reaper.
//!
//! Grounded on `client/src/pool/exclusive.rs` (`Pool`, `PooledConn`,
//! `ConnState`), adapted from that file's semaphore-queueing `acquire` to
//! fail fast on saturation instead of waiting for a permit (see
//! `DESIGN.md`, Open Question (b)), and from a `Deref`-based `Conn` guard
//! to a plain owned `Connection<S>` handle returned to the caller, since
//! this crate's `Connection` is already a cheap `Arc` clone rather than a
//! value the pool needs to reclaim through `Drop`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::engine::{Connection, State};
use crate::error::Error;
use crate::origin::Origin;
use crate::stream::ByteStream;

/// Dials a fresh [`ByteStream`] for an origin. Implemented by the caller;
/// this crate has no TCP/TLS connector of its own (spec Non-goal).
pub trait Connector<S>: Send + Sync {
    fn connect(&self, origin: &Origin) -> impl Future<Output = Result<S, Error>> + Send;
}

struct PooledConn<S> {
    conn: Connection<S>,
    idle_since: Instant,
}

struct OriginEntry<S> {
    idle: Vec<PooledConn<S>>,
    leased: Vec<Connection<S>>,
    /// Slots claimed for a dial already in flight but not yet registered
    /// in `leased`; counted toward capacity so concurrent `acquire` calls
    /// for the same origin cannot both decide there is room to dial.
    reserved: usize,
}

impl<S> Default for OriginEntry<S> {
    fn default() -> Self {
        Self { idle: Vec::new(), leased: Vec::new(), reserved: 0 }
    }
}

impl<S> OriginEntry<S> {
    fn leased_count(&self) -> usize {
        self.leased.len() + self.reserved
    }

    fn total_count(&self) -> usize {
        self.idle.len() + self.leased_count()
    }
}

/// Holds one origin's `reserved` slot claimed while a dial is in flight.
/// `new` is called while the caller already holds `entries`'s lock and
/// has just incremented `reserved` itself; the guard only records what to
/// undo. If the dial completes (success or failure) the caller calls
/// [`Self::disarm`] after accounting for the slot itself; otherwise — in
/// particular if `acquire`'s future is dropped while awaiting the dial —
/// `Drop` reclaims the slot so a cancelled dial never leaks capacity.
struct ReservationGuard<'a, S> {
    entries: &'a Mutex<HashMap<Origin, OriginEntry<S>>>,
    origin: Origin,
    armed: bool,
}

impl<'a, S> ReservationGuard<'a, S> {
    fn new(entries: &'a Mutex<HashMap<Origin, OriginEntry<S>>>, origin: Origin) -> Self {
        Self { entries, origin, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<'a, S> Drop for ReservationGuard<'a, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.origin) {
            entry.reserved = entry.reserved.saturating_sub(1);
        }
        warn!(target: "h1_pool", origin = %self.origin, "dial cancelled, releasing reserved slot");
    }
}

/// Current size of one origin's entry, for callers inspecting pool
/// pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginSizes {
    pub idle: usize,
    pub leased: usize,
}

/// A snapshot of the whole pool's occupancy.
#[derive(Debug, Clone, Default)]
pub struct PoolSizes {
    pub total_idle: usize,
    pub total_leased: usize,
    pub per_origin: Vec<(Origin, OriginSizes)>,
}

/// Aggregated counters across every connection the pool currently holds
/// (idle or leased). Connections already dropped after a failed release
/// are not represented.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub requests_served: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

/// A per-origin idle connection cache. `S` is the transport type;
/// `C` dials new connections for origins the pool has not seen yet, or
/// whose idle entries have all expired.
pub struct Pool<S, C> {
    entries: Mutex<HashMap<Origin, OriginEntry<S>>>,
    connector: C,
    config: PoolConfig,
    stopped: Mutex<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<S, C> Pool<S, C>
where
    S: ByteStream,
    C: Connector<S> + Send + Sync + 'static,
{
    /// Panics if `config.max_total == 0` or `config.max_per_host == 0`: an
    /// unusable capacity is a caller programming error, not a runtime
    /// condition to propagate as a `Result`.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        assert!(config.max_total > 0, "Pool: max_total must be greater than zero");
        assert!(config.max_per_host > 0, "Pool: max_per_host must be greater than zero");
        Self {
            entries: Mutex::new(HashMap::new()),
            connector,
            config,
            stopped: Mutex::new(false),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a connection for `origin`: a reusable idle entry if one is
    /// available, otherwise a freshly dialed connection if capacity
    /// allows. Fails fast with [`crate::error::Kind::Capacity`] rather
    /// than queueing when the origin or the pool as a whole is saturated.
    pub async fn acquire(&self, origin: &Origin) -> Result<Connection<S>, Error> {
        if *self.stopped.lock().unwrap() {
            return Err(Error::state("acquire attempted after pool stop"));
        }

        enum Decision<'a, S> {
            Ready(Connection<S>),
            Dial(ReservationGuard<'a, S>),
            Rejected(Error),
        }

        let (decision, to_close) = {
            let mut entries = self.entries.lock().unwrap();
            let mut to_close = Vec::new();

            {
                let entry = entries.entry(origin.clone()).or_default();
                reap_expired(entry, self.config.keep_alive_timeout, &mut to_close);
            }

            // Borrows of `entries` below are kept to single statements so a
            // mutable borrow of one entry never overlaps an immutable scan
            // of the whole map (`total_count`).
            let reused = entries.get_mut(origin).unwrap().idle.pop();
            let decision = if let Some(pooled) = reused {
                entries.get_mut(origin).unwrap().leased.push(pooled.conn.clone());
                Decision::Ready(pooled.conn)
            } else if entries.get(origin).unwrap().leased_count() < self.config.max_per_host {
                if total_count(&entries) < self.config.max_total {
                    entries.get_mut(origin).unwrap().reserved += 1;
                    Decision::Dial(ReservationGuard::new(&self.entries, origin.clone()))
                } else {
                    reap_all_expired(&mut entries, self.config.keep_alive_timeout, &mut to_close);
                    if total_count(&entries) < self.config.max_total {
                        entries.entry(origin.clone()).or_default().reserved += 1;
                        Decision::Dial(ReservationGuard::new(&self.entries, origin.clone()))
                    } else {
                        Decision::Rejected(Error::capacity("pool is at its max_total capacity"))
                    }
                }
            } else {
                Decision::Rejected(Error::capacity("origin is at its max_per_host capacity"))
            };

            (decision, to_close)
        };

        for conn in to_close {
            conn.close().await;
        }

        match decision {
            Decision::Ready(conn) => {
                debug!(target: "h1_pool", %origin, "reused idle connection");
                Ok(conn)
            }
            Decision::Rejected(e) => Err(e),
            // `guard` is held across the dial's `.await`; if this future is
            // dropped before the dial resolves (caller cancellation), its
            // `Drop` reclaims the reserved slot. On either outcome below we
            // account for the slot ourselves and disarm it.
            Decision::Dial(guard) => match self.connector.connect(origin).await {
                Ok(stream) => {
                    let conn = Connection::new(stream, self.config.engine_config());
                    let mut entries = self.entries.lock().unwrap();
                    let entry = entries.entry(origin.clone()).or_default();
                    entry.reserved -= 1;
                    entry.leased.push(conn.clone());
                    drop(entries);
                    guard.disarm();
                    debug!(target: "h1_pool", %origin, "dialed new connection");
                    Ok(conn)
                }
                Err(e) => {
                    let mut entries = self.entries.lock().unwrap();
                    if let Some(entry) = entries.get_mut(origin) {
                        entry.reserved = entry.reserved.saturating_sub(1);
                    }
                    drop(entries);
                    guard.disarm();
                    Err(e)
                }
            },
        }
    }

    /// Return a leased connection to the pool. `Idle` connections go back
    /// onto the origin's idle list; `Closed` (and any other non-`Idle`)
    /// connections are dropped from the pool's counts entirely.
    pub async fn release(&self, conn: Connection<S>, origin: &Origin) {
        let state = conn.state().await;

        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(origin) else { return };

        if let Some(pos) = entry.leased.iter().position(|c| c.ptr_eq(&conn)) {
            entry.leased.remove(pos);
        }

        match state {
            State::Idle => {
                entry.idle.push(PooledConn { conn, idle_since: Instant::now() });
                debug!(target: "h1_pool", %origin, "connection released to idle");
            }
            State::Closed | State::Active | State::New => {
                debug!(target: "h1_pool", %origin, ?state, "connection dropped from pool on release");
            }
        }
    }

    /// Current occupancy, per origin and in aggregate.
    pub fn sizes(&self) -> PoolSizes {
        let entries = self.entries.lock().unwrap();
        let mut sizes = PoolSizes::default();
        for (origin, entry) in entries.iter() {
            sizes.total_idle += entry.idle.len();
            sizes.total_leased += entry.leased_count();
            sizes.per_origin.push((origin.clone(), OriginSizes { idle: entry.idle.len(), leased: entry.leased_count() }));
        }
        sizes
    }

    pub fn origin_sizes(&self, origin: &Origin) -> OriginSizes {
        let entries = self.entries.lock().unwrap();
        match entries.get(origin) {
            Some(entry) => OriginSizes { idle: entry.idle.len(), leased: entry.leased_count() },
            None => OriginSizes::default(),
        }
    }

    /// Aggregate `requests_served`/`bytes_sent`/`bytes_received`/`errors`
    /// across every connection currently held by the pool, idle or leased.
    pub async fn aggregate_stats(&self) -> PoolStats {
        let snapshot: Vec<Connection<S>> = {
            let entries = self.entries.lock().unwrap();
            entries
                .values()
                .flat_map(|e| e.idle.iter().map(|p| p.conn.clone()).chain(e.leased.iter().cloned()))
                .collect()
        };

        let mut out = PoolStats::default();
        for conn in snapshot {
            let stats = conn.stats().await;
            out.requests_served += u64::from(stats.requests_served);
            out.bytes_sent += stats.bytes_sent;
            out.bytes_received += stats.bytes_received;
            out.errors += u64::from(stats.errors);
        }
        out
    }

    /// One reaper sweep: close every idle connection past `keep_alive_timeout`
    /// across all origins. Candidates are collected under the lock; the
    /// actual transport close happens after it is released.
    async fn reap_once(&self) {
        let to_close = {
            let mut entries = self.entries.lock().unwrap();
            let mut to_close = Vec::new();
            reap_all_expired(&mut entries, self.config.keep_alive_timeout, &mut to_close);
            to_close
        };
        if !to_close.is_empty() {
            warn!(target: "h1_pool", count = to_close.len(), "reaper reclaiming expired idle connections");
        }
        for conn in to_close {
            conn.close().await;
        }
    }
}

impl<S, C> Pool<S, C>
where
    S: ByteStream,
    C: Connector<S> + Send + Sync + 'static,
{
    /// Start the background reaper. Idempotent: calling `start` while
    /// already running is a no-op.
    pub fn start(self: &std::sync::Arc<Self>) {
        let mut guard = self.reaper.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let pool = self.clone();
        let interval = self.config.cleanup_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                pool.reap_once().await;
            }
        }));
    }

    /// Stop the reaper and close every connection the pool holds, idle or
    /// leased. After `stop`, `acquire` fails immediately with
    /// [`crate::error::Kind::State`].
    pub async fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }

        let all: Vec<Connection<S>> = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .values_mut()
                .flat_map(|e| {
                    let idle = std::mem::take(&mut e.idle).into_iter().map(|p| p.conn);
                    let leased = std::mem::take(&mut e.leased).into_iter();
                    idle.chain(leased)
                })
                .collect()
        };

        for conn in all {
            conn.close().await;
        }
    }
}

fn total_count<S>(entries: &HashMap<Origin, OriginEntry<S>>) -> usize {
    entries.values().map(OriginEntry::total_count).sum()
}

fn reap_expired<S>(entry: &mut OriginEntry<S>, timeout: std::time::Duration, out: &mut Vec<Connection<S>>) {
    let idle = std::mem::take(&mut entry.idle);
    let (expired, kept): (Vec<_>, Vec<_>) = idle.into_iter().partition(|p| p.idle_since.elapsed() > timeout);
    entry.idle = kept;
    out.extend(expired.into_iter().map(|p| p.conn));
}

fn reap_all_expired<S>(
    entries: &mut HashMap<Origin, OriginEntry<S>>,
    timeout: std::time::Duration,
    out: &mut Vec<Connection<S>>,
) {
    for entry in entries.values_mut() {
        reap_expired(entry, timeout, out);
    }
}
