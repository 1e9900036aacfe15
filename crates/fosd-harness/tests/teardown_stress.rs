#![forbid(unsafe_code)]
//! Randomized multi-threaded teardown races.
//!
//! Every round installs a batch of backoffs across several sessions and
//! placement groups, then tears everything down from both directions at
//! once: each session closes while each pg releases, some entries
//! individually and the rest in bulk. Afterwards every registry must be
//! empty, every backoff reclaimed, and no backoff may have produced more
//! than one unblock notice.

use fosd_backoff::{Backoff, BackoffScope, Session};
use fosd_harness::{StubPg, UnblockNotice};
use fosd_types::{Epoch, ObjectId, PgId, Tid};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier, Weak};
use std::thread;

const SESSIONS: usize = 4;
const PGS: usize = 4;
const ENTRIES_PER_ROUND: u64 = 96;
/// Name space deliberately smaller than the entry count so scope keys
/// collide and entry replacement gets exercised under contention.
const NAME_SPACE: u64 = 48;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

struct Installed {
    weaks: Vec<Weak<Backoff>>,
    /// Scopes per pg, for the single-release threads.
    pg_scopes: Vec<Vec<BackoffScope>>,
}

fn install_round(
    rng_state: &mut u64,
    sessions: &[Arc<Session>],
    pgs: &[Arc<StubPg>],
) -> Installed {
    let mut weaks = Vec::new();
    let mut pg_scopes = vec![Vec::new(); pgs.len()];

    for i in 0..ENTRIES_PER_ROUND {
        let session = &sessions[(lcg_next(rng_state) % sessions.len() as u64) as usize];
        let pg_idx = (lcg_next(rng_state) % pgs.len() as u64) as usize;
        let pg = &pgs[pg_idx];

        let scope = if lcg_next(rng_state) % 4 == 0 {
            BackoffScope::Pg(pg.pg_id())
        } else {
            let name = lcg_next(rng_state) % NAME_SPACE;
            BackoffScope::Object(ObjectId::head(pg.pg_id().pool, format!("obj{name}")))
        };

        let (backoff, _message) = pg.add_backoff(session, scope.clone(), Tid(i), 0, Epoch(1));
        weaks.push(Arc::downgrade(&backoff));
        pg_scopes[pg_idx].push(scope);
    }

    Installed { weaks, pg_scopes }
}

#[test]
fn stress_concurrent_teardown_from_both_directions() {
    let rounds = read_env_u64("FOSD_STRESS_ROUNDS", 12);
    let mut rng_state = 0x5EED_0D5D_u64;

    for round in 0..rounds {
        let sessions: Vec<_> = (0..SESSIONS)
            .map(|i| Session::new(format!("client.{round}.{i}")))
            .collect();
        let pgs: Vec<_> = (0..PGS)
            .map(|i| StubPg::new(PgId::new(round, i as u32)))
            .collect();

        let installed = install_round(&mut rng_state, &sessions, &pgs);

        let barrier = Arc::new(Barrier::new(SESSIONS + PGS));
        let mut handles = Vec::new();

        for session in &sessions {
            let session = Arc::clone(session);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                session.clear_backoffs();
                Vec::new()
            }));
        }
        for (pg, scopes) in pgs.iter().zip(installed.pg_scopes) {
            let pg = Arc::clone(pg);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut notices: Vec<UnblockNotice> = Vec::new();
                // Release the first half one at a time, then sweep the rest.
                let split = scopes.len() / 2;
                for scope in &scopes[..split] {
                    notices.extend(pg.release_backoff(scope));
                }
                notices.extend(pg.release_backoffs());
                notices
            }));
        }

        let mut notices = Vec::new();
        for handle in handles {
            notices.extend(handle.join().expect("teardown thread"));
        }

        for session in &sessions {
            assert!(session.is_empty(), "round {round}: session registry not empty");
        }
        for pg in &pgs {
            assert!(pg.is_empty(), "round {round}: pg index not empty");
        }

        // At most one unblock notice per backoff, ever.
        let mut seen = BTreeSet::new();
        for notice in &notices {
            let ptr = Arc::as_ptr(&notice.backoff) as usize;
            assert!(
                seen.insert(ptr),
                "round {round}: duplicate unblock notice for one backoff",
            );
            assert!(!notice.backoff.is_linked());
        }

        drop(notices);
        for (i, weak) in installed.weaks.iter().enumerate() {
            assert!(
                weak.upgrade().is_none(),
                "round {round}: backoff {i} still reachable after teardown",
            );
        }
    }
}
