//! Connection state: blacklist plus pending and active conn bookkeeping.
//!
//! All state sits behind one mutex that is never held across an await. The
//! blacklist expires lazily: lookups ignore expired entries, writes to the
//! same key replace them, and [`ConnState::snapshot`] compacts them out.

mod clock;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
pub use clock::{Clock, ManualClock, SystemClock};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ConnStateConfig;
use crate::conn::{Conn, ConnKey};
use crate::torrent::{InfoHash, PeerId};

/// Errors returned when admitting a new conn.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnStateError {
    #[error("Peer {peer_id} is blacklisted for {info_hash} until {expires_at}")]
    Blacklisted {
        peer_id: PeerId,
        info_hash: InfoHash,
        expires_at: DateTime<Utc>,
    },

    #[error("Conn to {peer_id} for {info_hash} already exists")]
    ConnExists { peer_id: PeerId, info_hash: InfoHash },

    #[error("Torrent {info_hash} already has {max} open conns")]
    TooManyConns { info_hash: InfoHash, max: usize },

    #[error("Refusing to connect to self")]
    SelfConnection,

    #[error("No pending conn to {peer_id} for {info_hash}")]
    NotPending { peer_id: PeerId, info_hash: InfoHash },
}

/// A (peer, torrent) pair excluded from connection attempts until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlacklistedConn {
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

impl BlacklistedConn {
    /// Returns true while the entry still blocks connections.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left until expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

type PairKey = (PeerId, InfoHash);

#[derive(Debug, Default)]
struct Inner {
    config: ConnStateConfig,
    blacklist: HashMap<PairKey, BlacklistedConn>,
    pending: HashSet<PairKey>,
    active: HashMap<InfoHash, HashMap<PeerId, Arc<Conn>>>,
}

impl Inner {
    fn open_count(&self, info_hash: InfoHash) -> usize {
        let pending = self.pending.iter().filter(|(_, h)| *h == info_hash).count();
        let active = self.active.get(&info_hash).map_or(0, HashMap::len);
        pending + active
    }

    fn is_active(&self, peer_id: PeerId, info_hash: InfoHash) -> bool {
        self.active
            .get(&info_hash)
            .is_some_and(|conns| conns.contains_key(&peer_id))
    }
}

/// Registry of blacklisted, pending and active conns for one node.
#[derive(Debug)]
pub struct ConnState {
    local_peer_id: PeerId,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl ConnState {
    pub fn new(local_peer_id: PeerId, mut config: ConnStateConfig, clock: Arc<dyn Clock>) -> Self {
        config.apply_defaults();
        Self {
            local_peer_id,
            clock,
            inner: Mutex::new(Inner {
                config,
                ..Inner::default()
            }),
        }
    }

    /// Creates a registry driven by the system clock.
    pub fn with_system_clock(local_peer_id: PeerId, config: ConnStateConfig) -> Self {
        Self::new(local_peer_id, config, Arc::new(SystemClock))
    }

    /// Current time according to the registry's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Blacklists the pair for one cooldown from now, replacing any entry.
    pub fn record_failure(
        &self,
        peer_id: PeerId,
        info_hash: InfoHash,
        reason: impl Into<String>,
    ) -> BlacklistedConn {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let cooldown = clock::to_chrono(inner.config.blacklist_cooldown);
        let entry = BlacklistedConn {
            peer_id,
            info_hash,
            reason: reason.into(),
            expires_at: now
                .checked_add_signed(cooldown)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        inner.blacklist.insert((peer_id, info_hash), entry.clone());

        info!(
            "Blacklisted {} for {} until {}: {}",
            peer_id, info_hash, entry.expires_at, entry.reason
        );
        entry
    }

    /// Returns true if the pair has an unexpired blacklist entry at `now`.
    pub fn is_blacklisted(&self, peer_id: PeerId, info_hash: InfoHash, now: DateTime<Utc>) -> bool {
        self.inner
            .lock()
            .blacklist
            .get(&(peer_id, info_hash))
            .is_some_and(|entry| entry.is_active(now))
    }

    /// Unexpired entries at `now`, ordered by expiry. Expired ones are dropped.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<BlacklistedConn> {
        let mut inner = self.inner.lock();
        inner.blacklist.retain(|_, entry| entry.is_active(now));

        let mut entries: Vec<_> = inner.blacklist.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        entries
    }

    /// Swaps limits. Existing blacklist entries keep their expiry.
    pub fn set_config(&self, mut config: ConnStateConfig) {
        config.apply_defaults();
        debug!(
            "Conn state reconfigured: cooldown={:?}, max_open={}",
            config.blacklist_cooldown, config.max_open_conns_per_torrent
        );
        self.inner.lock().config = config;
    }

    pub fn config(&self) -> ConnStateConfig {
        self.inner.lock().config.clone()
    }

    pub fn blacklist_cooldown(&self) -> Duration {
        self.inner.lock().config.blacklist_cooldown
    }

    /// Reserves a slot for a conn that is about to be handshaken.
    ///
    /// # Errors
    ///
    /// - `ConnStateError::SelfConnection` - If `peer_id` is the local peer
    /// - `ConnStateError::Blacklisted` - If the pair is blacklisted
    /// - `ConnStateError::ConnExists` - If the pair is already pending or active
    /// - `ConnStateError::TooManyConns` - If the torrent is at its conn limit
    pub fn add_pending(&self, peer_id: PeerId, info_hash: InfoHash) -> Result<(), ConnStateError> {
        if peer_id == self.local_peer_id {
            return Err(ConnStateError::SelfConnection);
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let key = (peer_id, info_hash);

        if let Some(entry) = inner.blacklist.get(&key) {
            if entry.is_active(now) {
                return Err(ConnStateError::Blacklisted {
                    peer_id,
                    info_hash,
                    expires_at: entry.expires_at,
                });
            }
            inner.blacklist.remove(&key);
        }

        if inner.pending.contains(&key) || inner.is_active(peer_id, info_hash) {
            return Err(ConnStateError::ConnExists { peer_id, info_hash });
        }

        let max = inner.config.max_open_conns_per_torrent;
        if inner.open_count(info_hash) >= max {
            return Err(ConnStateError::TooManyConns { info_hash, max });
        }

        inner.pending.insert(key);
        Ok(())
    }

    /// Releases a pending slot. Returns false if there was none.
    pub fn delete_pending(&self, peer_id: PeerId, info_hash: InfoHash) -> bool {
        self.inner.lock().pending.remove(&(peer_id, info_hash))
    }

    /// Promotes a pending slot to an active conn.
    ///
    /// # Errors
    ///
    /// - `ConnStateError::NotPending` - If no slot was reserved for the pair
    /// - `ConnStateError::ConnExists` - If the pair already has an active conn
    pub fn move_pending_to_active(&self, conn: Arc<Conn>) -> Result<(), ConnStateError> {
        let peer_id = conn.peer_id();
        let info_hash = conn.info_hash();
        let mut inner = self.inner.lock();

        if !inner.pending.remove(&(peer_id, info_hash)) {
            return Err(ConnStateError::NotPending { peer_id, info_hash });
        }
        if inner.is_active(peer_id, info_hash) {
            return Err(ConnStateError::ConnExists { peer_id, info_hash });
        }

        inner
            .active
            .entry(info_hash)
            .or_default()
            .insert(peer_id, conn);
        Ok(())
    }

    /// Forgets the active conn identified by `key`.
    ///
    /// A newer conn for the same pair is left alone.
    pub fn delete_active(&self, key: ConnKey) -> Option<Arc<Conn>> {
        let mut inner = self.inner.lock();
        let conns = inner.active.get_mut(&key.info_hash)?;

        if conns.get(&key.peer_id)?.key().id != key.id {
            return None;
        }
        let removed = conns.remove(&key.peer_id);
        if conns.is_empty() {
            inner.active.remove(&key.info_hash);
        }
        removed
    }

    /// Active conns for one torrent.
    pub fn active_conns(&self, info_hash: InfoHash) -> Vec<Arc<Conn>> {
        self.inner
            .lock()
            .active
            .get(&info_hash)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_active(&self, info_hash: InfoHash) -> usize {
        self.inner.lock().active.get(&info_hash).map_or(0, HashMap::len)
    }

    /// Every active conn across all torrents.
    pub fn all_active(&self) -> Vec<Arc<Conn>> {
        self.inner
            .lock()
            .active
            .values()
            .flat_map(|conns| conns.values().cloned())
            .collect()
    }

    /// Drops all pending and active bookkeeping for a torrent and returns
    /// the conns that were active so the caller can close them.
    pub fn remove_torrent(&self, info_hash: InfoHash) -> Vec<Arc<Conn>> {
        let mut inner = self.inner.lock();
        inner.pending.retain(|(_, hash)| *hash != info_hash);
        inner
            .active
            .remove(&info_hash)
            .map(|conns| conns.into_values().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ConnConfig;
    use crate::conn::connection::ConnParts;
    use crate::conn::{BandwidthLimiter, ConnOrigin};
    use crate::torrent::Bitfield;

    const LOCAL: PeerId = PeerId::new([0; 20]);

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 20])
    }

    fn hash(n: u8) -> InfoHash {
        InfoHash::new([n; 20])
    }

    fn state(clock: &ManualClock) -> ConnState {
        ConnState::new(
            LOCAL,
            ConnStateConfig {
                blacklist_cooldown: Duration::from_secs(30),
                max_open_conns_per_torrent: 2,
            },
            Arc::new(clock.clone()),
        )
    }

    async fn live_conn(id: u64, peer_id: PeerId, info_hash: InfoHash) -> Arc<Conn> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (events, _) = mpsc::channel(4);
        let parts = ConnParts {
            key: ConnKey {
                id,
                peer_id,
                info_hash,
            },
            local_peer_id: LOCAL,
            name: "blob".to_string(),
            remote_bitfield: Bitfield::new(1),
            origin: ConnOrigin::Local,
        };
        Arc::new(Conn::start(
            client.unwrap(),
            parts,
            &ConnConfig::default(),
            Arc::new(BandwidthLimiter::unlimited()),
            events,
        ))
    }

    #[test]
    fn test_blacklist_expires_after_cooldown() {
        let clock = ManualClock::default();
        let state = state(&clock);

        let entry = state.record_failure(peer(1), hash(1), "dial failed");
        assert_eq!(entry.expires_at, clock.now() + chrono::Duration::seconds(30));
        assert!(state.is_blacklisted(peer(1), hash(1), clock.now()));
        assert!(!state.is_blacklisted(peer(1), hash(2), clock.now()));

        clock.advance(Duration::from_secs(29));
        assert!(state.is_blacklisted(peer(1), hash(1), clock.now()));
        assert_eq!(entry.remaining(clock.now()), Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        assert!(!state.is_blacklisted(peer(1), hash(1), clock.now()));
    }

    #[test]
    fn test_new_failure_overwrites_entry() {
        let clock = ManualClock::default();
        let state = state(&clock);

        state.record_failure(peer(1), hash(1), "first");
        clock.advance(Duration::from_secs(20));
        let second = state.record_failure(peer(1), hash(1), "second");

        let snapshot = state.snapshot(clock.now());
        assert_eq!(snapshot, vec![second]);
        assert_eq!(snapshot[0].reason, "second");
    }

    #[test]
    fn test_snapshot_compacts_expired_entries() {
        let clock = ManualClock::default();
        let state = state(&clock);

        state.record_failure(peer(1), hash(1), "old");
        clock.advance(Duration::from_secs(10));
        state.record_failure(peer(2), hash(1), "new");
        clock.advance(Duration::from_secs(25));

        let snapshot = state.snapshot(clock.now());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer_id, peer(2));
        assert_eq!(state.inner.lock().blacklist.len(), 1);
    }

    #[test]
    fn test_cooldown_change_affects_future_failures_only() {
        let clock = ManualClock::default();
        let state = state(&clock);

        let before = state.record_failure(peer(1), hash(1), "before");
        state.set_config(ConnStateConfig {
            blacklist_cooldown: Duration::from_secs(300),
            max_open_conns_per_torrent: 2,
        });
        let after = state.record_failure(peer(2), hash(1), "after");

        assert_eq!(before.expires_at, clock.now() + chrono::Duration::seconds(30));
        assert_eq!(after.expires_at, clock.now() + chrono::Duration::seconds(300));
        assert_eq!(state.blacklist_cooldown(), Duration::from_secs(300));
    }

    #[test]
    fn test_add_pending_rules() {
        let clock = ManualClock::default();
        let state = state(&clock);

        assert_eq!(
            state.add_pending(LOCAL, hash(1)),
            Err(ConnStateError::SelfConnection)
        );

        state.add_pending(peer(1), hash(1)).unwrap();
        assert_eq!(
            state.add_pending(peer(1), hash(1)),
            Err(ConnStateError::ConnExists {
                peer_id: peer(1),
                info_hash: hash(1)
            })
        );

        state.add_pending(peer(2), hash(1)).unwrap();
        assert_eq!(
            state.add_pending(peer(3), hash(1)),
            Err(ConnStateError::TooManyConns {
                info_hash: hash(1),
                max: 2
            })
        );
        // Other torrents have their own budget.
        state.add_pending(peer(3), hash(2)).unwrap();

        assert!(state.delete_pending(peer(2), hash(1)));
        assert!(!state.delete_pending(peer(2), hash(1)));
        state.add_pending(peer(3), hash(1)).unwrap();
    }

    #[test]
    fn test_add_pending_refuses_blacklisted_until_expiry() {
        let clock = ManualClock::default();
        let state = state(&clock);

        state.record_failure(peer(1), hash(1), "timeout");
        assert!(matches!(
            state.add_pending(peer(1), hash(1)),
            Err(ConnStateError::Blacklisted { .. })
        ));

        clock.advance(Duration::from_secs(31));
        state.add_pending(peer(1), hash(1)).unwrap();
        assert!(state.snapshot(clock.now()).is_empty());
    }

    #[tokio::test]
    async fn test_active_conn_lifecycle() {
        let clock = ManualClock::default();
        let state = state(&clock);
        let conn = live_conn(7, peer(1), hash(1)).await;

        assert!(matches!(
            state.move_pending_to_active(Arc::clone(&conn)),
            Err(ConnStateError::NotPending { .. })
        ));

        state.add_pending(peer(1), hash(1)).unwrap();
        state.move_pending_to_active(Arc::clone(&conn)).unwrap();
        assert_eq!(state.num_active(hash(1)), 1);
        assert_eq!(state.all_active().len(), 1);
        assert!(matches!(
            state.add_pending(peer(1), hash(1)),
            Err(ConnStateError::ConnExists { .. })
        ));

        let stale = ConnKey {
            id: 6,
            peer_id: peer(1),
            info_hash: hash(1),
        };
        assert!(state.delete_active(stale).is_none());
        assert_eq!(state.num_active(hash(1)), 1);

        let removed = state.delete_active(conn.key()).unwrap();
        assert_eq!(removed.key(), conn.key());
        assert_eq!(state.num_active(hash(1)), 0);
        assert!(state.active_conns(hash(1)).is_empty());
    }

    #[tokio::test]
    async fn test_remove_torrent_returns_active_conns() {
        let clock = ManualClock::default();
        let state = state(&clock);
        let conn = live_conn(1, peer(1), hash(1)).await;

        state.add_pending(peer(1), hash(1)).unwrap();
        state.move_pending_to_active(conn).unwrap();
        state.add_pending(peer(2), hash(1)).unwrap();

        let removed = state.remove_torrent(hash(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(state.num_active(hash(1)), 0);
        assert!(!state.delete_pending(peer(2), hash(1)));
    }

    #[test]
    fn test_blacklist_serializes_for_reports() {
        let clock = ManualClock::default();
        let state = state(&clock);
        state.record_failure(peer(1), hash(2), "malformed");

        let json = serde_json::to_value(state.snapshot(clock.now())).unwrap();
        assert_eq!(json[0]["peer_id"], "01".repeat(20));
        assert_eq!(json[0]["info_hash"], "02".repeat(20));
        assert_eq!(json[0]["reason"], "malformed");
    }
}
