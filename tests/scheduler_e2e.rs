//! End-to-end scheduling behaviour against a live loopback server.

mod common;

use std::time::Duration;

use common::{ServerFixture, TestReinit, TestUnit, WorkerEvent, event_index, wait_until};
use turnstile::RpcError;
use turnstile::SequenceNumber;
use turnstile::server::ShutdownCause;

/// Ordered pipeline: one session, sequences submitted out of wire order,
/// executed in ascending order.
#[test]
fn ordered_pipeline_executes_in_sequence_order() {
    let fixture = ServerFixture::start(|_| {});

    // Keep the worker busy so all sequenced submissions are queued (and the
    // heap sorted) before the first ordered dispatch.
    let warmup = {
        let client = fixture.client("warmup:w");
        std::thread::spawn(move || {
            client
                .submit_work(TestUnit::sleeping("warmup", 400), SequenceNumber::out_of_order())
                .unwrap()
        })
    };
    std::thread::sleep(Duration::from_millis(100));

    let uploader = fixture.uploader("alice:x");
    uploader.upload(TestReinit::tagged("rx"));
    assert!(wait_until(Duration::from_secs(2), || uploader.is_notified()));

    let mut submissions = Vec::new();
    for seq in [4u64, 2, 0, 3, 1] {
        let client = fixture.client("alice:x");
        submissions.push(std::thread::spawn(move || {
            client.submit_work(TestUnit::tagged(&format!("w{seq}")), SequenceNumber::new(seq))
        }));
        std::thread::sleep(Duration::from_millis(10));
    }

    warmup.join().unwrap();
    for handle in submissions {
        handle.join().unwrap().expect("ordered submission succeeds");
    }

    let tags = fixture.work_tags();
    assert_eq!(tags, vec!["warmup", "w0", "w1", "w2", "w3", "w4"]);

    // The session's reinit ran before its first work unit.
    let events = fixture.events();
    let reinit = event_index(&events, |e| matches!(e, WorkerEvent::Reinit(t) if t == "rx"))
        .expect("reinit performed");
    let first_work = event_index(&events, |e| matches!(e, WorkerEvent::Work(t) if t == "w0"))
        .expect("w0 ran");
    assert!(reinit < first_work);

    // The counter has moved past all five units: resubmitting an old number
    // is rejected.
    let client = fixture.client("alice:x");
    let err = client
        .submit_work(TestUnit::tagged("stale"), SequenceNumber::new(4))
        .unwrap_err();
    match err {
        RpcError::Rejected(payload) => assert_eq!(payload.code, "invalid_sequence_number"),
        other => panic!("unexpected error: {other}"),
    }
}

/// Two users with a zero slice are served strictly alternately.
#[test]
fn zero_slice_rotates_between_users() {
    let fixture = ServerFixture::start(|c| {
        c.period_per_user_ms = 0;
    });

    let warmup = {
        let client = fixture.client("warmup:w");
        std::thread::spawn(move || {
            client
                .submit_work(TestUnit::sleeping("warmup", 400), SequenceNumber::out_of_order())
                .unwrap()
        })
    };
    std::thread::sleep(Duration::from_millis(100));

    let mut submissions = Vec::new();
    for i in 0..5u64 {
        for user in ["a", "b"] {
            let client = fixture.client(&format!("{user}:s"));
            let tag = format!("{user}{i}");
            submissions.push(std::thread::spawn(move || {
                client
                    .submit_work(TestUnit::sleeping(&tag, 5), SequenceNumber::out_of_order())
            }));
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    warmup.join().unwrap();
    for handle in submissions {
        handle.join().unwrap().expect("submission succeeds");
    }

    let tags = fixture.work_tags();
    assert_eq!(tags[0], "warmup");
    let users: Vec<char> = tags[1..].iter().map(|t| t.chars().next().unwrap()).collect();
    assert_eq!(users.len(), 10);
    for pair in users.windows(2) {
        assert_ne!(pair[0], pair[1], "dispatch order was {tags:?}");
    }
}

/// Reinit programs are interleaved with session switches: each session's
/// program runs before its work, never another session's.
#[test]
fn reinit_interleaves_with_session_switches() {
    let fixture = ServerFixture::start(|_| {});

    let uploader_one = fixture.uploader("alice:s1");
    let uploader_two = fixture.uploader("bob:s2");
    uploader_one.upload(TestReinit::tagged("r1"));
    uploader_two.upload(TestReinit::tagged("r2"));
    assert!(wait_until(Duration::from_secs(2), || {
        uploader_one.is_notified() && uploader_two.is_notified()
    }));

    let client_one = fixture.client("alice:s1");
    client_one
        .submit_work(TestUnit::tagged("work1"), SequenceNumber::out_of_order())
        .expect("first session's work");

    let client_two = fixture.client("bob:s2");
    client_two
        .submit_work(TestUnit::tagged("work2"), SequenceNumber::out_of_order())
        .expect("second session's work");

    let events = fixture.events();
    let r1 = event_index(&events, |e| matches!(e, WorkerEvent::Reinit(t) if t == "r1")).unwrap();
    let w1 = event_index(&events, |e| matches!(e, WorkerEvent::Work(t) if t == "work1")).unwrap();
    let r2 = event_index(&events, |e| matches!(e, WorkerEvent::Reinit(t) if t == "r2")).unwrap();
    let w2 = event_index(&events, |e| matches!(e, WorkerEvent::Work(t) if t == "work2")).unwrap();
    assert!(r1 < w1, "r1 before work1: {events:?}");
    assert!(w1 < r2, "switch happens after work1: {events:?}");
    assert!(r2 < w2, "r2 before work2: {events:?}");

    let r1_count = events
        .iter()
        .filter(|e| matches!(e, WorkerEvent::Reinit(t) if t == "r1"))
        .count();
    assert_eq!(r1_count, 1, "r1 never reapplied for the other session");
}

/// A missing sequence number holds back its session but not other users.
#[test]
fn sequence_gap_does_not_block_other_users() {
    let fixture = ServerFixture::start(|_| {});

    let alice = fixture.client("alice:gap");
    alice
        .submit_work(TestUnit::tagged("s0"), SequenceNumber::new(0))
        .expect("s0 runs immediately");

    let blocked = {
        let client = fixture.client("alice:gap");
        std::thread::spawn(move || {
            client.submit_work(TestUnit::tagged("s2"), SequenceNumber::new(2))
        })
    };
    std::thread::sleep(Duration::from_millis(150));

    let tom = fixture.client("tom:t");
    for i in 0..3 {
        tom.submit_work(
            TestUnit::tagged(&format!("t{i}")),
            SequenceNumber::out_of_order(),
        )
        .expect("unrelated user is not blocked by the gap");
    }

    alice
        .submit_work(TestUnit::tagged("s1"), SequenceNumber::new(1))
        .expect("gap filled");
    blocked
        .join()
        .unwrap()
        .expect("held-back unit runs once its predecessor arrived");

    let tags = fixture.work_tags();
    let pos = |tag: &str| tags.iter().position(|t| t == tag).unwrap();
    assert!(pos("s0") < pos("t0"), "order was {tags:?}");
    assert!(pos("t2") < pos("s1"), "order was {tags:?}");
    assert!(pos("s1") < pos("s2"), "order was {tags:?}");
}

/// A restarted server adopts the counter of a still-running client, and
/// rejects anything below it afterwards.
#[test]
fn fresh_server_fast_forwards_to_the_client_counter() {
    let fixture = ServerFixture::start(|_| {});
    let client = fixture.client("carol:cx");

    client
        .submit_work(TestUnit::tagged("c3"), SequenceNumber::new(3))
        .expect("fast-forwarded and executed");

    let err = client
        .submit_work(TestUnit::tagged("c2"), SequenceNumber::new(2))
        .unwrap_err();
    match err {
        RpcError::Rejected(payload) => assert_eq!(payload.code, "invalid_sequence_number"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.work_tags(), vec!["c3"]);
}

/// A parked pending offer is aborted when a newer program is announced; the
/// new offer proceeds normally and the old payload is never applied.
#[test]
fn superseded_pending_is_aborted() {
    let fixture = ServerFixture::start(|_| {});

    let client = fixture.client("dave:dx");
    client.reinit_notify(1, None).unwrap();

    let parked = {
        let client = fixture.client("dave:dx");
        std::thread::spawn(move || client.reinit_pending(1, None))
    };
    std::thread::sleep(Duration::from_millis(100));
    assert!(!parked.is_finished(), "matching offer stays parked");

    client.reinit_notify(2, None).unwrap();
    assert_eq!(
        parked.join().unwrap().expect("pending resolves"),
        false,
        "superseded offer is told not to upload"
    );

    // The new offer parks and serves the upload when the scheduler asks.
    let serving = {
        let client = fixture.client("dave:dx");
        std::thread::spawn(move || {
            let wanted = client.reinit_pending(2, None).expect("pending resolves");
            if wanted {
                client
                    .reinit_upload(&TestReinit::tagged("new"), 2, None)
                    .expect("upload accepted");
            }
            wanted
        })
    };
    std::thread::sleep(Duration::from_millis(50));

    // An upload under the superseded id is dropped silently.
    client
        .reinit_upload(&TestReinit::tagged("old"), 1, None)
        .unwrap();

    client
        .submit_work(TestUnit::tagged("dw"), SequenceNumber::out_of_order())
        .expect("work runs after the new reinit arrived");
    assert!(serving.join().unwrap(), "new offer was requested");

    let events = fixture.events();
    let reinit = event_index(&events, |e| matches!(e, WorkerEvent::Reinit(t) if t == "new"))
        .expect("new program applied");
    let work = event_index(&events, |e| matches!(e, WorkerEvent::Work(t) if t == "dw")).unwrap();
    assert!(reinit < work);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, WorkerEvent::Reinit(t) if t == "old")),
        "stale payload was never stored or applied: {events:?}"
    );
}

/// With a zero release interval the worker relinquishes the resource as soon
/// as the queue drains.
#[test]
fn zero_release_interval_tears_down_when_drained() {
    let fixture = ServerFixture::start(|c| {
        c.release_interval_secs = 0;
    });

    let client = fixture.client("erin:e");
    client
        .submit_work(TestUnit::tagged("solo"), SequenceNumber::out_of_order())
        .unwrap();

    assert!(
        fixture.wait_for_events(Duration::from_secs(2), |events| {
            events.last() == Some(&WorkerEvent::Teardown)
        }),
        "worker released after the queue drained: {:?}",
        fixture.events()
    );
    assert_eq!(
        fixture.events(),
        vec![
            WorkerEvent::Setup,
            WorkerEvent::Work("solo".into()),
            WorkerEvent::Teardown
        ]
    );
}

/// An idle timeout brings the whole server down with the idle cause.
#[test]
fn idle_timeout_stops_the_server() {
    let fixture = ServerFixture::start(|c| {
        c.idle_timeout_secs = 1;
    });
    assert_eq!(fixture.wait_shutdown(), ShutdownCause::IdleTimeout);
}

/// Rejected callers never reach a queue.
#[test]
fn unauthorized_user_data_is_rejected() {
    let fixture = ServerFixture::start(|_| {});
    let client = fixture.client("no-colon-here");
    let err = client
        .submit_work(TestUnit::tagged("nope"), SequenceNumber::out_of_order())
        .unwrap_err();
    match err {
        RpcError::Rejected(payload) => assert_eq!(payload.code, "user_not_authorized"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.work_tags().is_empty());
}

/// A worker fault is committed to the failing call, tears the worker down and
/// leaves the session usable.
#[test]
fn worker_fault_commits_error_and_tears_down() {
    let fixture = ServerFixture::start(|_| {});
    let client = fixture.client("frank:f");

    let err = client
        .submit_work(TestUnit::failing("boom"), SequenceNumber::out_of_order())
        .unwrap_err();
    match err {
        RpcError::Rejected(payload) => assert_eq!(payload.code, "worker_fault"),
        other => panic!("unexpected error: {other}"),
    }

    assert!(fixture.wait_for_events(Duration::from_secs(2), |events| {
        events.contains(&WorkerEvent::Teardown)
    }));

    client
        .submit_work(TestUnit::tagged("after"), SequenceNumber::out_of_order())
        .expect("session continues after the fault");
    assert!(fixture.work_tags().contains(&"after".to_string()));
}
