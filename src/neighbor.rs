//! ARP-derived neighbor cache for TUN-mode links.
//!
//! Entries are learned from observed ARP traffic and expire when unseen for
//! too long. The periodic sweep re-triggers resolution for both live and
//! expired entries through a [`NeighborListener`], so active destinations
//! stay resolved without waiting for new outbound traffic.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::debug;

/// Default sweep cadence.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default entry lifetime without a refresh.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// One learned IP-to-MAC binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub hwaddr: [u8; 6],
    pub ipaddr: Ipv4Addr,
    pub created: Instant,
    pub last_seen: Instant,
}

impl NeighborEntry {
    pub fn new(hwaddr: [u8; 6], ipaddr: Ipv4Addr) -> Self {
        let now = Instant::now();
        Self {
            hwaddr,
            ipaddr,
            created: now,
            last_seen: now,
        }
    }
}

/// Receives sweep notifications; both callbacks re-send an ARP request.
pub trait NeighborListener: Send + Sync {
    /// A live entry survived a sweep tick.
    fn on_interval(&self, entry: &NeighborEntry);
    /// An entry aged out and was removed.
    fn on_expire(&self, entry: &NeighborEntry);
}

/// Neighbor cache keyed by IPv4 address.
pub struct NeighborTable {
    entries: Mutex<HashMap<u32, NeighborEntry>>,
    timeout: Duration,
    listener: OnceLock<Arc<dyn NeighborListener>>,
}

impl NeighborTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
            listener: OnceLock::new(),
        }
    }

    /// Register the resolution listener. Later calls are ignored.
    pub fn set_listener(&self, listener: Arc<dyn NeighborListener>) {
        let _ = self.listener.set(listener);
    }

    /// Upsert a binding: refresh the hardware address and last-seen time.
    pub fn add(&self, hwaddr: [u8; 6], ipaddr: Ipv4Addr) {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(u32::from(ipaddr))
            .and_modify(|e| {
                e.hwaddr = hwaddr;
                e.last_seen = Instant::now();
            })
            .or_insert_with(|| {
                debug!(ip = %ipaddr, "neighbor learned");
                NeighborEntry::new(hwaddr, ipaddr)
            });
    }

    /// Look up the binding for `ipaddr`.
    pub fn get_by_addr(&self, ipaddr: Ipv4Addr) -> Option<NeighborEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(&u32::from(ipaddr))
            .copied()
    }

    /// Drop every entry. Used when the local synthetic address changes.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// One sweep pass at time `now`: expired entries are removed with the
    /// expire callback, survivors get the interval callback.
    pub fn sweep(&self, now: Instant) {
        let (expired, live) = {
            let mut entries = self.entries.lock().unwrap();
            let dead: Vec<u32> = entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_seen) > self.timeout)
                .map(|(k, _)| *k)
                .collect();
            let expired: Vec<NeighborEntry> =
                dead.iter().filter_map(|k| entries.remove(k)).collect();
            let live: Vec<NeighborEntry> = entries.values().copied().collect();
            (expired, live)
        };

        let Some(listener) = self.listener.get() else {
            return;
        };
        for entry in &expired {
            debug!(ip = %entry.ipaddr, "neighbor expired");
            listener.on_expire(entry);
        }
        for entry in &live {
            listener.on_interval(entry);
        }
    }

    /// Spawn the periodic sweep task; aborted via the returned handle.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let table = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh table
            // is not swept before anything could be learned.
            tick.tick().await;
            loop {
                tick.tick().await;
                table.sweep(Instant::now());
            }
        })
    }
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const MAC2: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

    struct Recorder {
        intervals: AtomicUsize,
        expires: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                intervals: AtomicUsize::new(0),
                expires: AtomicUsize::new(0),
            })
        }
    }

    impl NeighborListener for Recorder {
        fn on_interval(&self, _entry: &NeighborEntry) {
            self.intervals.fetch_add(1, Ordering::SeqCst);
        }
        fn on_expire(&self, _entry: &NeighborEntry) {
            self.expires.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_and_get() {
        let table = NeighborTable::default();
        let ip = Ipv4Addr::new(10, 0, 0, 7);

        assert!(table.get_by_addr(ip).is_none());
        table.add(MAC, ip);

        let entry = table.get_by_addr(ip).unwrap();
        assert_eq!(entry.hwaddr, MAC);
        assert_eq!(entry.ipaddr, ip);
    }

    #[test]
    fn test_add_refreshes_existing() {
        let table = NeighborTable::default();
        let ip = Ipv4Addr::new(10, 0, 0, 7);

        table.add(MAC, ip);
        let first = table.get_by_addr(ip).unwrap();

        table.add(MAC2, ip);
        let second = table.get_by_addr(ip).unwrap();
        assert_eq!(second.hwaddr, MAC2);
        assert_eq!(second.created, first.created);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expiry_boundary() {
        // Timeout 180s: present one second before the deadline, gone one
        // second after.
        let table = NeighborTable::new(Duration::from_secs(180));
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        table.add(MAC, ip);
        let added = table.get_by_addr(ip).unwrap().last_seen;

        table.sweep(added + Duration::from_secs(179));
        assert!(table.get_by_addr(ip).is_some());

        table.sweep(added + Duration::from_secs(181));
        assert!(table.get_by_addr(ip).is_none());
    }

    #[test]
    fn test_sweep_callbacks() {
        let table = NeighborTable::new(Duration::from_secs(60));
        let recorder = Recorder::new();
        table.set_listener(recorder.clone());

        let fresh = Ipv4Addr::new(10, 0, 0, 1);
        let stale = Ipv4Addr::new(10, 0, 0, 2);
        table.add(MAC, fresh);
        table.add(MAC2, stale);

        // Age only the stale entry past the timeout.
        {
            let mut entries = table.entries.lock().unwrap();
            let entry = entries.get_mut(&u32::from(stale)).unwrap();
            entry.last_seen = Instant::now() - Duration::from_secs(120);
        }

        table.sweep(Instant::now());
        assert_eq!(recorder.expires.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.intervals.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_clear() {
        let table = NeighborTable::default();
        table.add(MAC, Ipv4Addr::new(10, 0, 0, 1));
        table.add(MAC2, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(table.len(), 2);

        table.clear();
        assert!(table.is_empty());
    }
}
