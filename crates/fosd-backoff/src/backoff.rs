//! The backoff entity: one throttle instance, jointly owned by a session
//! and a placement group.

use crate::rank::{RANK_BACKOFF, RankedGuard, RankedMutex};
use crate::session::Session;
use fosd_types::{ObjectId, PgId, Tid};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

/// What a backoff throttles: a whole placement group, or one object.
///
/// Exactly one of the two, by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffScope {
    Pg(PgId),
    Object(ObjectId),
}

impl fmt::Display for BackoffScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pg(pg_id) => write!(f, "pg {pg_id}"),
            Self::Object(object_id) => write!(f, "object {object_id}"),
        }
    }
}

/// The placement-group side of the backoff relationship.
///
/// Implemented by the (external) placement-group component. `rm_backoff` is
/// called by [`Session::clear_backoffs`] during connection teardown; it must
/// remove `backoff` from the group's own index, idempotently, taking only
/// the index's own rank-2 lock. The `state` parameter is the caller's proof
/// that the backoff's lock is held.
pub trait PgBackoffIndex: Send + Sync {
    fn rm_backoff(&self, backoff: &Arc<Backoff>, state: &BackoffState);
}

/// The pair of ownership back-links.
///
/// The links are weak: the owning maps hold the `Arc`s, these only answer
/// "who owns me" lookups. Holding both in one struct behind one `Option`
/// makes "pg and session are set together or cleared together" true by
/// construction.
#[derive(Debug, Clone)]
pub struct BackoffLinks {
    pg: Weak<dyn PgBackoffIndex>,
    session: Weak<Session>,
}

impl BackoffLinks {
    /// The owning placement group, if it is still alive.
    #[must_use]
    pub fn pg(&self) -> Option<Arc<dyn PgBackoffIndex>> {
        self.pg.upgrade()
    }

    /// The owning session, if it is still alive.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// True iff `session` is the live owner recorded in this link pair.
    #[must_use]
    pub fn is_session(&self, session: &Arc<Session>) -> bool {
        self.session
            .upgrade()
            .is_some_and(|held| Arc::ptr_eq(&held, session))
    }

    /// True iff `pg` is the live owner recorded in this link pair.
    #[must_use]
    pub fn is_pg(&self, pg: &Arc<dyn PgBackoffIndex>) -> bool {
        self.pg.upgrade().is_some_and(|held| Arc::ptr_eq(&held, pg))
    }
}

/// Mutable state of a backoff: the ownership link pair.
///
/// Only reachable through [`Backoff::lock`], so every read or write of the
/// links happens under the backoff's own rank-3 lock.
#[derive(Debug, Default)]
pub struct BackoffState {
    links: Option<BackoffLinks>,
}

impl BackoffState {
    /// The current link pair, or `None` once either side has torn down.
    #[must_use]
    pub fn links(&self) -> Option<&BackoffLinks> {
        self.links.as_ref()
    }

    /// Clear the link pair, returning what was set.
    pub fn unlink(&mut self) -> Option<BackoffLinks> {
        self.links.take()
    }
}

/// One throttle instance.
///
/// Scope and trigger markers are fixed at creation; only the link pair is
/// mutable, and only under [`Backoff::lock`]. The `Arc` is held by exactly
/// two owners (the session registry and the pg index); whichever of them
/// drops its clone last frees the backoff.
#[derive(Debug)]
pub struct Backoff {
    scope: BackoffScope,
    first_tid: Tid,
    first_attempt: u32,
    state: RankedMutex<BackoffState>,
}

impl Backoff {
    /// Create an unlinked backoff.
    #[must_use]
    pub fn new(scope: BackoffScope, first_tid: Tid, first_attempt: u32) -> Arc<Self> {
        Arc::new(Self {
            scope,
            first_tid,
            first_attempt,
            state: RankedMutex::new("Backoff::state", RANK_BACKOFF, BackoffState::default()),
        })
    }

    #[must_use]
    pub fn scope(&self) -> &BackoffScope {
        &self.scope
    }

    /// The first request the client must hold back.
    #[must_use]
    pub fn first_tid(&self) -> Tid {
        self.first_tid
    }

    /// Attempt number of that request.
    #[must_use]
    pub fn first_attempt(&self) -> u32 {
        self.first_attempt
    }

    /// Acquire the backoff's own lock (rank 3, outermost).
    pub fn lock(&self) -> RankedGuard<'_, BackoffState> {
        self.state.lock()
    }

    /// Record joint ownership by `pg` and `session`.
    ///
    /// Takes the backoff's lock internally; the caller must not hold it.
    ///
    /// # Panics
    ///
    /// If the backoff is already linked. Linking is a create-time operation;
    /// a second link means two owners believe they installed the same
    /// backoff, which is an ownership-model bug.
    pub fn link(&self, pg: &Arc<dyn PgBackoffIndex>, session: &Arc<Session>) {
        let mut state = self.lock();
        assert!(
            state.links.is_none(),
            "backoff {} already linked to a pg/session pair",
            self.scope,
        );
        state.links = Some(BackoffLinks {
            pg: Arc::downgrade(pg),
            session: Arc::downgrade(session),
        });
        trace!(scope = %self.scope, client = session.client(), "backoff linked");
    }

    /// Whether the pg/session pair is currently set (acquires the lock).
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.lock().links.is_some()
    }
}
