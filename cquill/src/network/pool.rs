//! Shared pool bookkeeping: per-endpoint connection counters and the
//! trashcan holding surplus-but-healthy connections.
//!
//! The counter is the single source of truth for how many connections
//! exist towards an endpoint; `increase`/`decrease` are the only
//! sanctioned way to admit or retire one. A connection is always in
//! exactly one place: the active pool, the trashcan, or freed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::network::connection::Connection;

/// Connections of one endpoint, keyed by connection id.
pub(crate) type HostPool = Arc<DashMap<Uuid, Arc<Connection>>>;

/// Per-endpoint connection counts, enforcing the max-per-host cap.
pub(crate) struct ConnectionCounters {
    counts: DashMap<SocketAddr, usize>,
}

impl ConnectionCounters {
    pub(crate) fn new() -> Self {
        ConnectionCounters {
            counts: DashMap::new(),
        }
    }

    /// Reserves a slot: inserts 1 if absent, increments if below `cap`.
    /// Returns false (and changes nothing) at the cap. The entry guard
    /// makes the check-and-mutate atomic against concurrent callers.
    pub(crate) fn increase(&self, endpoint: SocketAddr, cap: usize) -> bool {
        match self.counts.entry(endpoint) {
            Entry::Occupied(mut entry) => {
                if *entry.get() < cap {
                    *entry.get_mut() += 1;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if cap == 0 {
                    return false;
                }
                entry.insert(1);
                true
            }
        }
    }

    /// Retires a slot, clamping at zero.
    pub(crate) fn decrease(&self, endpoint: SocketAddr) {
        if let Some(mut count) = self.counts.get_mut(&endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    pub(crate) fn get(&self, endpoint: SocketAddr) -> usize {
        self.counts.get(&endpoint).map(|c| *c).unwrap_or(0)
    }
}

struct TrashedConnection {
    conn: Arc<Connection>,
    expires_at: Instant,
}

/// Time-bounded holding area for connections that were surplus to the
/// pool's needs but are still open and healthy. Parking is reversible
/// until the sweep closes the entry.
pub(crate) struct Trashcan {
    parked: DashMap<SocketAddr, Vec<TrashedConnection>>,
    ttl: Duration,
}

impl Trashcan {
    pub(crate) fn new(ttl: Duration) -> Self {
        Trashcan {
            parked: DashMap::new(),
            ttl,
        }
    }

    /// Parks a connection with a fresh expiry deadline.
    pub(crate) fn put(&self, conn: Arc<Connection>) {
        trace!(endpoint = %conn.endpoint(), id = %conn.id(), "Parking connection in the trashcan");
        let trashed = TrashedConnection {
            expires_at: Instant::now() + self.ttl,
            conn,
        };
        self.parked
            .entry(trashed.conn.endpoint())
            .or_default()
            .push(trashed);
    }

    /// Removes and returns the most recently parked healthy connection
    /// for `endpoint`. Unhealthy entries are left for the sweep.
    pub(crate) fn recycle(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        let mut entry = self.parked.get_mut(&endpoint)?;
        let vec = entry.value_mut();
        let pos = vec.iter().rposition(|t| t.conn.is_healthy())?;
        let recycled = vec.remove(pos);
        trace!(endpoint = %endpoint, id = %recycled.conn.id(), "Recycled connection from the trashcan");
        Some(recycled.conn)
    }

    /// Closes and counter-retires every entry whose deadline has passed.
    /// Driven by the session's periodic sweeper task.
    pub(crate) fn sweep(&self, counters: &ConnectionCounters) {
        let endpoints: Vec<SocketAddr> = self.parked.iter().map(|entry| *entry.key()).collect();
        let now = Instant::now();

        for endpoint in endpoints {
            let expired = match self.parked.get_mut(&endpoint) {
                Some(mut entry) => {
                    let all = std::mem::take(entry.value_mut());
                    let (expired, kept): (Vec<_>, Vec<_>) =
                        all.into_iter().partition(|t| t.expires_at <= now);
                    *entry.value_mut() = kept;
                    expired
                }
                None => continue,
            };

            for trashed in expired {
                debug!(endpoint = %endpoint, id = %trashed.conn.id(), "Trashcan entry expired, closing connection");
                trashed.conn.close();
                counters.decrease(endpoint);
            }

            self.parked.remove_if(&endpoint, |_, vec| vec.is_empty());
        }
    }

    pub(crate) fn parked_count(&self, endpoint: SocketAddr) -> usize {
        self.parked.get(&endpoint).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn counter_allows_up_to_cap() {
        let counters = ConnectionCounters::new();
        let e = endpoint(9042);

        assert!(counters.increase(e, 2));
        assert!(counters.increase(e, 2));
        assert_eq!(counters.get(e), 2);

        // At the cap the count must not move.
        assert!(!counters.increase(e, 2));
        assert_eq!(counters.get(e), 2);
    }

    #[test]
    fn counter_one_below_cap_succeeds() {
        let counters = ConnectionCounters::new();
        let e = endpoint(9042);

        for _ in 0..7 {
            assert!(counters.increase(e, 8));
        }
        assert_eq!(counters.get(e), 7);
        assert!(counters.increase(e, 8));
        assert!(!counters.increase(e, 8));
    }

    #[test]
    fn counter_decrease_clamps_at_zero() {
        let counters = ConnectionCounters::new();
        let e = endpoint(9042);

        counters.decrease(e);
        assert_eq!(counters.get(e), 0);

        assert!(counters.increase(e, 1));
        counters.decrease(e);
        counters.decrease(e);
        assert_eq!(counters.get(e), 0);
    }

    #[test]
    fn counter_zero_cap_admits_nothing() {
        let counters = ConnectionCounters::new();
        assert!(!counters.increase(endpoint(9042), 0));
    }

    #[test]
    fn counters_are_per_endpoint() {
        let counters = ConnectionCounters::new();
        assert!(counters.increase(endpoint(1), 1));
        assert!(counters.increase(endpoint(2), 1));
        assert!(!counters.increase(endpoint(1), 1));
        assert_eq!(counters.get(endpoint(2)), 1);
    }
}
