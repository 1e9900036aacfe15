#![forbid(unsafe_code)]
//! End-to-end conformance scenarios for the backoff protocol.

use fosd_backoff::{BackoffScope, Session};
use fosd_harness::StubPg;
use fosd_types::{Epoch, ObjectId, PgId, SnapId, Tid};
use fosd_wire::{BackoffMessage, BackoffOp};
use std::sync::{Arc, Barrier, Weak};
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[test]
fn session_close_clears_the_pg_index() {
    init_tracing();
    let pg = StubPg::new(PgId::new(3, 0x1c));
    let session = Session::new("client.4123");
    let oid = ObjectId::head(3, "rbd_data.x");
    let (backoff, message) = pg.add_backoff(
        &session,
        BackoffScope::Object(oid.clone()),
        Tid(42),
        0,
        Epoch(880),
    );

    // The begin-block message survives the wire intact.
    let decoded = BackoffMessage::decode(&message.encode()).expect("decode");
    assert_eq!(decoded.op, BackoffOp::Block);
    assert_eq!(decoded.object_id, oid);
    assert_eq!(decoded.first_tid, Tid(42));
    assert_eq!(decoded.first_attempt, 0);
    assert_eq!(decoded.osd_epoch, Epoch(880));

    let weak: Weak<_> = Arc::downgrade(&backoff);
    drop(backoff);

    session.clear_backoffs();

    // Closing the session must leave the pg's index without the object and
    // the backoff unreachable from either side.
    assert!(pg.is_empty());
    assert!(session.is_empty());
    assert!(weak.upgrade().is_none(), "backoff still owned by something");
}

#[test]
fn pg_release_unblocks_the_client() {
    init_tracing();
    let pg = StubPg::new(PgId::new(1, 9));
    let session = Session::new("client.77");
    let scope = BackoffScope::Pg(PgId::new(1, 9));
    let (_backoff, _) = pg.add_backoff(&session, scope.clone(), Tid(1000), 3, Epoch(11));

    let notice = pg.release_backoff(&scope).expect("unblock notice");
    assert!(pg.is_empty());
    assert!(session.is_empty());

    // The unblock goes out after all locks are released.
    let message = notice.to_message(Epoch(12));
    assert_eq!(message.op, BackoffOp::Unblock);
    assert!(message.object_id.is_empty());
    let decoded = BackoffMessage::decode(&message.encode()).expect("decode");
    assert_eq!(decoded, message);
    assert_eq!(session.last_sent_epoch(), Epoch(12));
}

#[test]
fn teardown_clears_a_mixed_registry() {
    init_tracing();
    let pg_a = StubPg::new(PgId::new(3, 0));
    let pg_b = StubPg::new(PgId::new(4, 0));
    let session = Session::new("client.5");

    let mut backoffs = Vec::new();
    for i in 0..8_u64 {
        let (b, _) = pg_a.add_backoff(
            &session,
            BackoffScope::Object(ObjectId::new(3, format!("obj{i}"), SnapId(i))),
            Tid(i),
            0,
            Epoch(1),
        );
        backoffs.push(b);
    }
    let (b, _) = pg_b.add_backoff(&session, BackoffScope::Pg(PgId::new(4, 0)), Tid(99), 1, Epoch(1));
    backoffs.push(b);
    assert_eq!(session.backoff_count(), 9);

    session.clear_backoffs();

    assert!(session.is_empty());
    assert!(pg_a.is_empty());
    assert!(pg_b.is_empty());
    for backoff in &backoffs {
        assert!(!backoff.is_linked());
    }
}

#[test]
fn snapshot_and_head_share_one_throttle() {
    init_tracing();
    let pg = StubPg::new(PgId::new(3, 2));
    let session = Session::new("client.9");
    let (backoff, _) = pg.add_backoff(
        &session,
        BackoffScope::Object(ObjectId::head(3, "img")),
        Tid(10),
        0,
        Epoch(1),
    );

    // A read of an older snapshot of the same object hits the same entry.
    let found = session
        .object_backoff(&ObjectId::new(3, "img", SnapId(4)))
        .expect("snapshot covered by head backoff");
    assert!(Arc::ptr_eq(&found, &backoff));
}

#[test]
fn concurrent_session_close_and_pg_release() {
    init_tracing();
    // Both teardown directions race on the same backoff; exactly one side
    // must perform the unlink, and at most one unblock notice may exist.
    for round in 0..64_u64 {
        let pg = StubPg::new(PgId::new(7, 1));
        let session = Session::new(format!("client.{round}"));
        let scope = BackoffScope::Object(ObjectId::head(7, "contended"));
        let (backoff, _) = pg.add_backoff(&session, scope.clone(), Tid(round), 0, Epoch(1));
        let weak = Arc::downgrade(&backoff);
        drop(backoff);

        let barrier = Arc::new(Barrier::new(2));
        let close = {
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                session.clear_backoffs();
            })
        };
        let release = {
            let pg = Arc::clone(&pg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                pg.release_backoff(&scope)
            })
        };

        close.join().expect("close thread");
        let notice = release.join().expect("release thread");

        assert!(pg.is_empty());
        assert!(session.is_empty());
        drop(notice);
        assert!(
            weak.upgrade().is_none(),
            "round {round}: backoff leaked past both teardowns",
        );
    }
}

#[test]
fn concurrent_full_teardowns_from_both_sides() {
    init_tracing();
    for round in 0..32 {
        let pg = StubPg::new(PgId::new(2, 4));
        let session = Session::new(format!("client.{round}"));
        let mut weaks = Vec::new();
        for i in 0..16_u64 {
            let (b, _) = pg.add_backoff(
                &session,
                BackoffScope::Object(ObjectId::head(2, format!("o{i}"))),
                Tid(i),
                0,
                Epoch(1),
            );
            weaks.push(Arc::downgrade(&b));
        }

        let barrier = Arc::new(Barrier::new(2));
        let close = {
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                session.clear_backoffs();
            })
        };
        let release = {
            let pg = Arc::clone(&pg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                pg.release_backoffs()
            })
        };

        close.join().expect("close thread");
        let notices = release.join().expect("release thread");
        assert!(notices.len() <= 16);

        assert!(pg.is_empty());
        assert!(session.is_empty());
        drop(notices);
        for (i, weak) in weaks.iter().enumerate() {
            assert!(
                weak.upgrade().is_none(),
                "round {round}: backoff {i} leaked past both teardowns",
            );
        }
    }
}
