#![allow(dead_code)]

use std::str;
use std::thread;
use std::time::Duration;

use nats_requester::Connection;
use nats_test_server::NatsTestServer;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Answers every request on `subject` with its own payload, after sleeping
/// for as many milliseconds as the payload spells (no delay when it is not a
/// number). Requests are handled concurrently.
///
/// The responder stops once the returned connection is dropped.
pub fn delayed_echo(server: &NatsTestServer, subject: &str) -> Connection {
    let nc = nats_requester::connect(&server.url()).unwrap();
    let sub = nc.subscribe(subject).unwrap();
    nc.flush().unwrap();

    thread::spawn(move || {
        for msg in sub.messages() {
            thread::spawn(move || {
                let delay = str::from_utf8(&msg.data)
                    .ok()
                    .and_then(|delay| delay.parse().ok())
                    .unwrap_or(0);
                thread::sleep(Duration::from_millis(delay));
                msg.respond(&msg.data).ok();
            });
        }
    });

    nc
}
