#![forbid(unsafe_code)]
//! Reference in-memory placement group for exercising the backoff protocol.
//!
//! The real placement-group component lives outside this workspace; what
//! the backoff core needs from it is captured by
//! [`fosd_backoff::PgBackoffIndex`]. [`StubPg`] is the conforming
//! implementation used by the conformance and stress suites: a rank-2
//! locked index of `Arc<Backoff>` plus the pg-side install and release
//! paths, mirrored from the session-side algorithms.
//!
//! Release paths return [`UnblockNotice`]s instead of sending anything:
//! unblock messages go out after every lock is released, never under one.

use fosd_backoff::{
    Backoff, BackoffScope, BackoffState, PgBackoffIndex, RANK_PG_INDEX, RankedMutex, Session,
};
use fosd_types::{Epoch, ObjectKey, PgId, Tid};
use fosd_wire::{BackoffMessage, BackoffOp};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Index key for a backoff scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScopeKey {
    Pg(PgId),
    Object(ObjectKey),
}

impl ScopeKey {
    #[must_use]
    pub fn of(scope: &BackoffScope) -> Self {
        match scope {
            BackoffScope::Pg(pg_id) => Self::Pg(*pg_id),
            BackoffScope::Object(object_id) => Self::Object(object_id.base()),
        }
    }
}

/// A released backoff whose client still needs to be told.
///
/// Produced by the pg-side release paths while locks are held; turned into
/// a wire message by the caller afterwards.
pub struct UnblockNotice {
    pub session: Arc<Session>,
    pub backoff: Arc<Backoff>,
    pub pg_id: PgId,
}

impl UnblockNotice {
    /// Build the end-block message for this notice and record the epoch on
    /// the session.
    #[must_use]
    pub fn to_message(&self, epoch: Epoch) -> BackoffMessage {
        self.session.record_sent_epoch(epoch);
        match self.backoff.scope() {
            BackoffScope::Pg(pg_id) => BackoffMessage::for_pg(
                BackoffOp::Unblock,
                *pg_id,
                self.backoff.first_tid(),
                self.backoff.first_attempt(),
                epoch,
            ),
            BackoffScope::Object(object_id) => BackoffMessage::for_object(
                BackoffOp::Unblock,
                self.pg_id,
                object_id.clone(),
                self.backoff.first_tid(),
                self.backoff.first_attempt(),
                epoch,
            ),
        }
    }
}

/// In-memory placement-group backoff index.
pub struct StubPg {
    pg_id: PgId,
    index: RankedMutex<BTreeMap<ScopeKey, Arc<Backoff>>>,
}

impl StubPg {
    pub fn new(pg_id: PgId) -> Arc<Self> {
        Arc::new(Self {
            pg_id,
            index: RankedMutex::new("StubPg::index", RANK_PG_INDEX, BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn pg_id(&self) -> PgId {
        self.pg_id
    }

    #[must_use]
    pub fn backoff_count(&self) -> usize {
        self.index.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    fn as_dyn(self: &Arc<Self>) -> Arc<dyn PgBackoffIndex> {
        Arc::clone(self) as _
    }

    /// Decide to throttle `scope` for `session`: create the backoff, link
    /// it, and index it on both sides. Returns the backoff and the
    /// begin-block message to send to the client.
    pub fn add_backoff(
        self: &Arc<Self>,
        session: &Arc<Session>,
        scope: BackoffScope,
        first_tid: Tid,
        first_attempt: u32,
        epoch: Epoch,
    ) -> (Arc<Backoff>, BackoffMessage) {
        let backoff = Backoff::new(scope, first_tid, first_attempt);
        backoff.link(&self.as_dyn(), session);
        session.add_backoff(&backoff);
        self.index
            .lock()
            .insert(ScopeKey::of(backoff.scope()), Arc::clone(&backoff));
        debug!(pg = %self.pg_id, scope = %backoff.scope(), "backoff installed");

        session.record_sent_epoch(epoch);
        let message = match backoff.scope() {
            BackoffScope::Pg(pg_id) => {
                BackoffMessage::for_pg(BackoffOp::Block, *pg_id, first_tid, first_attempt, epoch)
            }
            BackoffScope::Object(object_id) => BackoffMessage::for_object(
                BackoffOp::Block,
                self.pg_id,
                object_id.clone(),
                first_tid,
                first_attempt,
                epoch,
            ),
        };
        (backoff, message)
    }

    /// Release one backoff by scope, the pg-side single teardown.
    ///
    /// Looks the entry up under the index lock, releases that lock, then
    /// re-examines under the backoff's own lock: if the link pair is gone
    /// the session side won the race and there is nothing left to do.
    ///
    /// # Panics
    ///
    /// If a still-linked backoff found in this index names a different pg.
    pub fn release_backoff(self: &Arc<Self>, scope: &BackoffScope) -> Option<UnblockNotice> {
        let key = ScopeKey::of(scope);
        let backoff = self.index.lock().get(&key).cloned()?;
        self.release_entry(backoff)
    }

    /// Tear one backoff down from the pg side.
    ///
    /// The index entry is erased only if it is still this very backoff: a
    /// replacement may have been installed at the same key after the caller
    /// picked this one up, and the replacement must keep its slot.
    fn release_entry(self: &Arc<Self>, backoff: Arc<Backoff>) -> Option<UnblockNotice> {
        let mut state = backoff.lock();
        let Some(links) = state.links() else {
            trace!(pg = %self.pg_id, scope = %backoff.scope(), "backoff already released");
            return None;
        };
        assert!(
            links.is_pg(&self.as_dyn()),
            "pg {}: backoff {} is linked to a different pg",
            self.pg_id,
            backoff.scope(),
        );
        let session = links.session();
        let key = ScopeKey::of(backoff.scope());
        {
            let mut index = self.index.lock();
            if index.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, &backoff)) {
                index.remove(&key);
            }
        }
        if let Some(session) = &session {
            session.rm_backoff(&backoff, &state);
        }
        state.unlink();
        drop(state);
        debug!(pg = %self.pg_id, scope = %backoff.scope(), "backoff released");

        session.map(|session| UnblockNotice {
            session,
            backoff,
            pg_id: self.pg_id,
        })
    }

    /// Release every backoff this pg still holds (pg teardown or interval
    /// change), the mirror of [`Session::clear_backoffs`].
    pub fn release_backoffs(self: &Arc<Self>) -> Vec<UnblockNotice> {
        let entries = std::mem::take(&mut *self.index.lock());
        debug!(pg = %self.pg_id, count = entries.len(), "pg releasing all backoffs");

        entries
            .into_values()
            .filter_map(|backoff| self.release_entry(backoff))
            .collect()
    }
}

impl PgBackoffIndex for StubPg {
    /// Called by the session side during [`Session::clear_backoffs`], with
    /// the backoff's lock held. May race with [`StubPg::release_backoffs`]
    /// swapping the index out; absence is benign, and only the exact entry
    /// is erased.
    fn rm_backoff(&self, backoff: &Arc<Backoff>, _state: &BackoffState) {
        let key = ScopeKey::of(backoff.scope());
        let mut index = self.index.lock();
        if index.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, backoff)) {
            index.remove(&key);
        }
        trace!(pg = %self.pg_id, scope = %backoff.scope(), "backoff removed from pg index");
    }
}
