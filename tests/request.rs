use std::thread;
use std::time::{Duration, Instant};

use nats_requester::{Options, Outcome, Payload, RequestErrorKind};
use nats_test_server::NatsTestServer;

mod util;
use util::*;

#[test]
fn reply_is_returned() {
    init_logging();
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");

    let nc = nats_requester::connect(&server.url()).unwrap();
    let start = Instant::now();
    let outcome = nc.request("frame", "1", Duration::from_secs(1)).unwrap();

    assert_eq!(outcome, Outcome::Reply(Payload::Bytes(b"1".to_vec())));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn reply_is_decoded_when_buffers_are_not_preserved() {
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");

    let nc = Options::new()
        .preserve_buffers(false)
        .connect(&server.url())
        .unwrap();
    let outcome = nc.request("frame", "1", Duration::from_secs(1)).unwrap();

    assert_eq!(outcome, Outcome::Reply(Payload::Text("1".to_string())));
}

#[test]
fn no_responder_times_out() {
    let server = NatsTestServer::build().spawn();
    let nc = nats_requester::connect(&server.url()).unwrap();

    let start = Instant::now();
    let outcome = nc.request("frame", "1", Duration::from_millis(200)).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, Outcome::Timeout);
    assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "{:?}", elapsed);
}

#[test]
fn late_reply_is_discarded() {
    init_logging();
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");
    let nc = nats_requester::connect(&server.url()).unwrap();

    // Answered after 300ms, long after the request gave up.
    let outcome = nc.request("frame", "300", Duration::from_millis(100)).unwrap();
    assert!(outcome.is_timeout());

    // The late "300" shows up while this one is waiting and must not be
    // taken for its reply.
    let outcome = nc.request("frame", "50", Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, Outcome::Reply(Payload::Bytes(b"50".to_vec())));

    thread::sleep(Duration::from_millis(300));
    let outcome = nc.request("frame", "0", Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, Outcome::Reply(Payload::Bytes(b"0".to_vec())));
}

#[test]
fn overlapping_requests_get_their_own_replies() {
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");
    let nc = nats_requester::connect(&server.url()).unwrap();

    // Slowest first, so replies come back in the opposite order.
    let handles: Vec<_> = ["200", "150", "100", "50", "0"]
        .into_iter()
        .map(|delay| {
            let nc = nc.clone();
            thread::spawn(move || {
                let outcome = nc.request("frame", delay, Duration::from_secs(2)).unwrap();
                (delay.to_string(), outcome)
            })
        })
        .collect();

    for handle in handles {
        let (delay, outcome) = handle.join().unwrap();
        assert_eq!(outcome, Outcome::Reply(Payload::Bytes(delay.into_bytes())));
    }
}

#[test]
fn losing_the_server_is_a_transport_error() {
    init_logging();
    let server = NatsTestServer::build().spawn();
    let nc = nats_requester::connect(&server.url()).unwrap();

    let request = thread::spawn({
        let nc = nc.clone();
        move || {
            let start = Instant::now();
            let result = nc.request("frame", "1", Duration::from_secs(5));
            (result, start.elapsed())
        }
    });

    thread::sleep(Duration::from_millis(200));
    server.evict_all();

    let (result, elapsed) = request.join().unwrap();
    let err = result.unwrap_err();
    assert_eq!(err.kind(), RequestErrorKind::Transport);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);

    // Nothing comes back after that.
    let err = nc
        .request("frame", "1", Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err.kind(), RequestErrorKind::Transport);
}

#[test]
fn closed_connection_is_a_transport_error() {
    let server = NatsTestServer::build().spawn();
    let nc = nats_requester::connect(&server.url()).unwrap();
    let nc2 = nc.clone();
    nc.close();

    assert!(nc2.is_closed());
    let err = nc2
        .request("frame", "1", Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err.kind(), RequestErrorKind::Transport);
}

#[test]
fn invalid_requests_are_rejected() {
    let server = NatsTestServer::build().spawn();
    let nc = nats_requester::connect(&server.url()).unwrap();
    let timeout = Duration::from_millis(100);

    let kind = |subject, timeout| nc.request(subject, "1", timeout).unwrap_err().kind();

    assert_eq!(kind("", timeout), RequestErrorKind::InvalidSubject);
    assert_eq!(kind("two words", timeout), RequestErrorKind::InvalidSubject);
    assert_eq!(kind("frame..1", timeout), RequestErrorKind::InvalidSubject);
    assert_eq!(kind("frame", Duration::ZERO), RequestErrorKind::InvalidTimeout);
}
