#![forbid(unsafe_code)]
//! Backoff admission control: per-session, per-scope client throttling.
//!
//! A [`Backoff`] represents one instance of either a placement group or a
//! single object being plugged at the client. It is shared between two
//! owners: the client [`Session`]'s registry and the owning placement
//! group's index (behind [`PgBackoffIndex`]). Either owner may decide to
//! tear the relationship down at any time, from its own thread.
//!
//! # Lock hierarchy
//!
//! Three locks coordinate the teardown, in a strict process-wide order:
//!
//! ```text
//! Backoff::state lock            (rank 3, acquire first)
//!    pg backoff-index lock       (rank 2)
//!       Session registry lock    (rank 1, innermost)
//! ```
//!
//! Any path needing two of them must acquire the higher rank first; the
//! [`rank`] module enforces this in debug builds. When a session goes away,
//! [`Session::clear_backoffs`] moves its indices aside under the rank-1
//! lock, releases it, and only then walks the entries under each backoff's
//! own rank-3 lock. When the placement group releases a backoff instead, it
//! holds the backoff's lock and calls [`Session::rm_backoff`]. Whichever
//! side finds the link pair still set performs the unlink; the other
//! observes an empty pair and does nothing. The link pair lives in a single
//! `Option<BackoffLinks>`, so "pg and session are set together or cleared
//! together" cannot be violated by construction.
//!
//! Nothing in this crate performs I/O or sends a message while holding any
//! of the three locks; unblock notifications are the caller's business,
//! after every lock is released.

mod backoff;
pub mod rank;
mod session;

pub use backoff::{Backoff, BackoffLinks, BackoffScope, BackoffState, PgBackoffIndex};
pub use rank::{RANK_BACKOFF, RANK_PG_INDEX, RANK_SESSION, RankedGuard, RankedMutex};
pub use session::Session;
