//! Per-client-connection backoff registry.

use crate::backoff::{Backoff, BackoffScope, BackoffState};
use crate::rank::{RANK_BACKOFF, RANK_SESSION, RankedMutex, rank_held};
use fosd_types::{Epoch, ObjectId, ObjectKey, PgId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// The session's two backoff indices, keyed by scope.
///
/// Object entries are keyed by [`ObjectKey`] (snapshot component stripped),
/// so all snapshots of one base object share a single throttle entry. The
/// maps are never reachable outside the session: the pg side coordinates
/// through `Arc<Backoff>` links only.
#[derive(Debug, Default)]
struct SessionBackoffs {
    by_object: BTreeMap<ObjectKey, Arc<Backoff>>,
    by_pg: BTreeMap<PgId, Arc<Backoff>>,
}

/// Server-side state for one client connection.
///
/// The registry lock is rank 1, the innermost of the hierarchy: it may be
/// taken while holding a backoff's lock and/or a pg index lock, never the
/// other way around.
#[derive(Debug)]
pub struct Session {
    client: String,
    last_sent_epoch: AtomicU32,
    backoffs: RankedMutex<SessionBackoffs>,
}

impl Session {
    pub fn new(client: impl Into<String>) -> Arc<Self> {
        let client = client.into();
        debug!(client = %client, "session opened");
        Arc::new(Self {
            client,
            last_sent_epoch: AtomicU32::new(0),
            backoffs: RankedMutex::new(
                "Session::backoffs",
                RANK_SESSION,
                SessionBackoffs::default(),
            ),
        })
    }

    #[must_use]
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Highest topology epoch this session has been told about.
    #[must_use]
    pub fn last_sent_epoch(&self) -> Epoch {
        Epoch(self.last_sent_epoch.load(Ordering::Relaxed))
    }

    /// Record that `epoch` was sent to the client (monotonic max).
    pub fn record_sent_epoch(&self, epoch: Epoch) {
        self.last_sent_epoch.fetch_max(epoch.0, Ordering::Relaxed);
    }

    /// Index a backoff under its scope key.
    ///
    /// Takes only the registry lock, so callers may already hold the
    /// backoff's lock and/or a pg index lock. Installing a second backoff
    /// at the same key replaces the entry; the previous backoff is then
    /// owned by the pg side alone until that side releases it.
    pub fn add_backoff(&self, backoff: &Arc<Backoff>) {
        let mut reg = self.backoffs.lock();
        match backoff.scope() {
            BackoffScope::Object(object_id) => {
                reg.by_object.insert(object_id.base(), Arc::clone(backoff));
            }
            BackoffScope::Pg(pg_id) => {
                reg.by_pg.insert(*pg_id, Arc::clone(backoff));
            }
        }
        trace!(client = %self.client, scope = %backoff.scope(), "backoff added to session");
    }

    /// The backoff covering `object_id`, if any (snapshot-insensitive).
    #[must_use]
    pub fn object_backoff(&self, object_id: &ObjectId) -> Option<Arc<Backoff>> {
        self.backoffs.lock().by_object.get(&object_id.base()).cloned()
    }

    /// The backoff covering the whole of `pg_id`, if any.
    #[must_use]
    pub fn pg_backoff(&self, pg_id: &PgId) -> Option<Arc<Backoff>> {
        self.backoffs.lock().by_pg.get(pg_id).cloned()
    }

    /// Number of backoffs currently indexed.
    #[must_use]
    pub fn backoff_count(&self) -> usize {
        let reg = self.backoffs.lock();
        reg.by_object.len() + reg.by_pg.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let reg = self.backoffs.lock();
        reg.by_object.is_empty() && reg.by_pg.is_empty()
    }

    /// Single-entry removal, invoked by the placement-group side while it
    /// tears down one backoff.
    ///
    /// The caller must hold `backoff`'s own lock; the `state` parameter can
    /// only be produced from that lock's guard, and a debug rank check
    /// verifies it. The entry may already be gone if a concurrent
    /// [`Session::clear_backoffs`] swapped the maps out first; that is a
    /// benign race, not an error. The entry is only erased if it is this
    /// very backoff, so a replacement installed at the same key survives.
    ///
    /// # Panics
    ///
    /// If `state`'s session link does not name this session: the caller is
    /// tearing down a backoff this session does not own, which is an
    /// ownership-model bug.
    pub fn rm_backoff(self: &Arc<Self>, backoff: &Arc<Backoff>, state: &BackoffState) {
        debug_assert!(
            rank_held(RANK_BACKOFF),
            "Session::rm_backoff called without the backoff lock held",
        );
        let owns = state.links().is_some_and(|links| links.is_session(self));
        assert!(
            owns,
            "Session::rm_backoff: backoff {} is not owned by session {}",
            backoff.scope(),
            self.client,
        );

        let mut reg = self.backoffs.lock();
        let removed = match backoff.scope() {
            BackoffScope::Object(object_id) => {
                let key = object_id.base();
                match reg.by_object.get(&key) {
                    Some(entry) if Arc::ptr_eq(entry, backoff) => {
                        reg.by_object.remove(&key);
                        true
                    }
                    _ => false,
                }
            }
            BackoffScope::Pg(pg_id) => match reg.by_pg.get(pg_id) {
                Some(entry) if Arc::ptr_eq(entry, backoff) => {
                    reg.by_pg.remove(pg_id);
                    true
                }
                _ => false,
            },
        };
        trace!(
            client = %self.client,
            scope = %backoff.scope(),
            removed,
            "single backoff removed from session",
        );
    }

    /// Full-registry teardown, run when the client connection goes away.
    ///
    /// Both maps are swapped into local temporaries under the registry lock
    /// (constant time), the lock is released, and only then is each backoff
    /// visited under its own rank-3 lock. A backoff whose link pair is
    /// already cleared lost a race with the pg-side release path and is
    /// skipped. For the rest, the owning placement group is asked to drop
    /// its index entry and the link pair is cleared. The temporaries drop
    /// last, releasing this session's share of every reference count.
    ///
    /// # Panics
    ///
    /// If a still-linked backoff names a different session: the registries
    /// and the link pairs disagree about ownership, which is an
    /// ownership-model bug.
    pub fn clear_backoffs(self: &Arc<Self>) {
        let (by_object, by_pg) = {
            let mut reg = self.backoffs.lock();
            (
                std::mem::take(&mut reg.by_object),
                std::mem::take(&mut reg.by_pg),
            )
        };
        debug!(
            client = %self.client,
            object_backoffs = by_object.len(),
            pg_backoffs = by_pg.len(),
            "session teardown: releasing backoffs",
        );

        for backoff in by_object.values().chain(by_pg.values()) {
            let mut state = backoff.lock();
            let Some(links) = state.links() else {
                // The pg side fully released this one already.
                trace!(scope = %backoff.scope(), "backoff already released");
                continue;
            };
            assert!(
                links.is_session(self),
                "session teardown: backoff {} is linked to a different session",
                backoff.scope(),
            );
            let pg = links.pg();
            if let Some(pg) = pg {
                pg.rm_backoff(backoff, &state);
            }
            state.unlink();
        }
    }
}
