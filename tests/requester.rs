use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nats_requester::requester::{Requester, RequesterConfig, Resolution};
use nats_requester::{ConfigErrorKind, Outcome, Payload, RequestErrorKind};
use nats_test_server::NatsTestServer;

mod util;
use util::*;

fn collect(requester: &Requester) -> Vec<Resolution> {
    let mut resolutions = Vec::new();
    let resolved = requester.run_with(|resolution| resolutions.push(resolution));
    assert_eq!(resolved as usize, resolutions.len());
    resolutions
}

fn ticks(resolutions: &[Resolution]) -> Vec<u64> {
    let mut ticks: Vec<_> = resolutions.iter().map(|r| r.tick).collect();
    ticks.sort_unstable();
    ticks
}

#[test]
fn every_tick_resolves_once() {
    init_logging();
    let server = NatsTestServer::build().spawn();

    // Answers every other request.
    let responder = nats_requester::connect(&server.url()).unwrap();
    let sub = responder.subscribe("frame").unwrap();
    responder.flush().unwrap();
    let seen = Arc::new(AtomicU64::new(0));
    thread::spawn({
        let seen = seen.clone();
        move || {
            for msg in sub.messages() {
                if seen.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    msg.respond("ok").ok();
                }
            }
        }
    });

    let nc = nats_requester::connect(&server.url()).unwrap();
    let config = RequesterConfig::default()
        .timeout(Duration::from_millis(50))
        .interval(Duration::from_millis(100))
        .max_ticks(6);
    let requester = Requester::new(nc, config).unwrap();

    let resolutions = collect(&requester);

    assert_eq!(ticks(&resolutions), vec![1, 2, 3, 4, 5, 6]);
    let replies = resolutions
        .iter()
        .filter(|r| matches!(&r.result, Ok(Outcome::Reply(payload)) if *payload == Payload::Bytes(b"ok".to_vec())))
        .count();
    let timeouts = resolutions
        .iter()
        .filter(|r| matches!(r.result, Ok(Outcome::Timeout)))
        .count();
    assert_eq!(replies, 3);
    assert_eq!(timeouts, 3);
    assert_eq!(seen.load(Ordering::SeqCst), 6);

    for resolution in &resolutions {
        if let Ok(Outcome::Timeout) = resolution.result {
            assert!(resolution.elapsed >= Duration::from_millis(50));
        }
    }
}

#[test]
fn slow_requests_do_not_delay_ticks() {
    let server = NatsTestServer::build().spawn();
    let nc = nats_requester::connect(&server.url()).unwrap();

    // Each request outlives several intervals.
    let config = RequesterConfig::default()
        .timeout(Duration::from_millis(400))
        .interval(Duration::from_millis(50))
        .max_ticks(4);
    let requester = Requester::new(nc, config).unwrap();

    let start = Instant::now();
    let resolutions = collect(&requester);
    let elapsed = start.elapsed();

    assert_eq!(ticks(&resolutions), vec![1, 2, 3, 4]);
    assert!(resolutions
        .iter()
        .all(|r| matches!(r.result, Ok(Outcome::Timeout))));
    // Run back to back, four requests would take at least 1.6s.
    assert!(elapsed < Duration::from_millis(1200), "{:?}", elapsed);
}

#[test]
fn stopper_ends_the_run() {
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");
    let nc = nats_requester::connect(&server.url()).unwrap();

    let config = RequesterConfig::default()
        .payload("20")
        .interval(Duration::from_millis(30));
    let requester = Requester::new(nc, config).unwrap();

    let stopper = requester.stopper();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        stopper.stop();
    });

    let resolutions = collect(&requester);

    assert!(!resolutions.is_empty());
    let expected: Vec<u64> = (1..=resolutions.len() as u64).collect();
    assert_eq!(ticks(&resolutions), expected);
    assert!(resolutions
        .iter()
        .all(|r| r.result.as_ref().map_or(false, |outcome| !outcome.is_timeout())));
}

#[test]
fn stop_before_run_is_ignored() {
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");
    let nc = nats_requester::connect(&server.url()).unwrap();

    let config = RequesterConfig::default()
        .payload("0")
        .interval(Duration::from_millis(20))
        .max_ticks(3);
    let requester = Requester::new(nc, config).unwrap();

    requester.stopper().stop();
    let resolutions = collect(&requester);
    assert_eq!(ticks(&resolutions), vec![1, 2, 3]);

    // A requester can run again once a run ended.
    requester.stopper().stop();
    assert_eq!(ticks(&collect(&requester)), vec![1, 2, 3]);
}

#[test]
fn transport_errors_do_not_stop_the_loop() {
    init_logging();
    let server = NatsTestServer::build().spawn();
    let _responder = delayed_echo(&server, "frame");
    let nc = nats_requester::connect(&server.url()).unwrap();

    let config = RequesterConfig::default()
        .payload("0")
        .timeout(Duration::from_millis(500))
        .interval(Duration::from_millis(100))
        .max_ticks(5);
    let requester = Requester::new(nc, config).unwrap();

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(250));
        server.evict_all();
        // Keep the server up until the run is over.
        thread::sleep(Duration::from_secs(2));
    });

    let resolutions = collect(&requester);

    assert_eq!(ticks(&resolutions), vec![1, 2, 3, 4, 5]);
    let failed: Vec<_> = resolutions
        .iter()
        .filter_map(|r| r.result.as_ref().err())
        .collect();
    assert!(!failed.is_empty());
    assert!(failed
        .iter()
        .all(|err| err.kind() == RequestErrorKind::Transport));
    assert!(matches!(
        resolutions.iter().find(|r| r.tick == 5).map(|r| &r.result),
        Some(Err(_))
    ));
}

#[test]
fn invalid_config_is_rejected() {
    let server = NatsTestServer::build().spawn();
    let nc = nats_requester::connect(&server.url()).unwrap();

    let err = Requester::new(nc.clone(), RequesterConfig::default().subject("")).unwrap_err();
    assert_eq!(err.kind(), ConfigErrorKind::EmptySubject);

    let err = Requester::new(
        nc,
        RequesterConfig::default().interval(Duration::from_millis(0)),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ConfigErrorKind::InvalidInterval);
}
