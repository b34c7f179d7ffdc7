// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Issues one request per tick of a fixed-period timer and reports how each
//! of them resolved.
//!
//! Ticks are scheduled an interval apart regardless of how long their
//! requests take, and every request runs on its own thread, so a slow
//! request never holds up the next tick.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;

use crate::error::{ConfigError, ConfigErrorKind, RequestError};
use crate::{is_valid_subject, Connection, Outcome};

/// What to request, how long to wait for it and how often.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequesterConfig {
    /// Subject each request is published on.
    pub subject: String,
    /// Body of each request.
    pub payload: Vec<u8>,
    /// How long a request waits for its reply.
    pub timeout: Duration,
    /// Time between two ticks.
    pub interval: Duration,
    /// Stop after this many ticks; `None` runs until stopped.
    pub max_ticks: Option<u64>,
}

impl Default for RequesterConfig {
    fn default() -> RequesterConfig {
        RequesterConfig {
            subject: "frame".to_string(),
            payload: b"1".to_vec(),
            timeout: Duration::from_millis(1000),
            interval: Duration::from_millis(2000),
            max_ticks: None,
        }
    }
}

impl RequesterConfig {
    pub fn subject(mut self, subject: &str) -> RequesterConfig {
        self.subject = subject.to_string();
        self
    }

    pub fn payload(mut self, payload: impl AsRef<[u8]>) -> RequesterConfig {
        self.payload = payload.as_ref().to_vec();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> RequesterConfig {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> RequesterConfig {
        self.interval = interval;
        self
    }

    pub fn max_ticks(mut self, max_ticks: u64) -> RequesterConfig {
        self.max_ticks = Some(max_ticks);
        self
    }

    /// Checks the configuration, reporting the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.is_empty() {
            return Err(ConfigErrorKind::EmptySubject.into());
        }
        if !is_valid_subject(&self.subject) {
            return Err(ConfigError::with_source(
                ConfigErrorKind::InvalidSubject,
                format!("{:?}", self.subject),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigErrorKind::InvalidTimeout.into());
        }
        if self.interval.is_zero() {
            return Err(ConfigErrorKind::InvalidInterval.into());
        }
        Ok(())
    }
}

/// How one tick ended.
#[derive(Debug)]
pub struct Resolution {
    /// Number of the tick, starting at 1.
    pub tick: u64,
    /// Time from issuing the request until it resolved.
    pub elapsed: Duration,
    pub result: Result<Outcome, RequestError>,
}

impl Resolution {
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

/// Logs a resolution: replies at info, timeouts at warn, failures at error.
pub fn log_resolution(resolution: &Resolution) {
    let tick = resolution.tick;
    let elapsed = resolution.elapsed_ms();
    match &resolution.result {
        Ok(Outcome::Reply(payload)) => {
            log::info!("tick {}: reply {} in {} ms", tick, payload, elapsed)
        }
        Ok(Outcome::Timeout) => {
            log::warn!("tick {}: request timed out after {} ms", tick, elapsed)
        }
        Err(err) => log::error!("tick {}: request failed after {} ms: {}", tick, elapsed, err),
    }
}

/// Ends a running [`Requester`] from another thread.
#[derive(Clone, Debug)]
pub struct Stopper(channel::Sender<()>);

impl Stopper {
    /// Stops the current run. Requests already in flight still resolve. A
    /// stop issued while the requester is not running has no effect.
    pub fn stop(&self) {
        self.0.try_send(()).ok();
    }
}

/// Periodically requests on a connection.
#[derive(Debug)]
pub struct Requester {
    connection: Connection,
    config: Arc<RequesterConfig>,
    stop_tx: channel::Sender<()>,
    stop_rx: channel::Receiver<()>,
}

impl Requester {
    /// Builds a requester, failing if `config` does not validate.
    pub fn new(connection: Connection, config: RequesterConfig) -> Result<Requester, ConfigError> {
        config.validate()?;
        let (stop_tx, stop_rx) = channel::bounded(1);
        Ok(Requester {
            connection,
            config: Arc::new(config),
            stop_tx,
            stop_rx,
        })
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.config
    }

    /// A handle that stops [`Requester::run`] from another thread.
    pub fn stopper(&self) -> Stopper {
        Stopper(self.stop_tx.clone())
    }

    /// Runs with [`log_resolution`] as the reporter. Returns the number of
    /// ticks that resolved.
    pub fn run(&self) -> u64 {
        self.run_with(|resolution| log_resolution(&resolution))
    }

    /// Runs until `max_ticks` ticks were started or the requester is
    /// stopped, handing every resolution to `report` on the calling thread.
    ///
    /// Returns once every started tick has resolved, so `report` sees each
    /// tick exactly once.
    pub fn run_with<F>(&self, mut report: F) -> u64
    where
        F: FnMut(Resolution),
    {
        let ticker = channel::tick(self.config.interval);
        let (done_tx, done_rx) = channel::unbounded();
        let stop = &self.stop_rx;

        // Only stops issued while this run is active count.
        while stop.try_recv().is_ok() {}

        let mut started = 0_u64;
        let mut resolved = 0_u64;

        log::debug!(
            "requesting on {} every {:?} with a {:?} timeout",
            self.config.subject,
            self.config.interval,
            self.config.timeout
        );

        loop {
            if self.config.max_ticks.map_or(false, |max| started >= max) {
                break;
            }

            channel::select! {
                recv(ticker) -> _ => {
                    started += 1;
                    self.spawn_tick(started, &done_tx);
                }
                recv(done_rx) -> resolution => {
                    if let Ok(resolution) = resolution {
                        resolved += 1;
                        report(resolution);
                    }
                }
                recv(stop) -> _ => {
                    log::debug!("requester stopped after {} ticks", started);
                    break;
                }
            }
        }

        // Wait for the ticks still in flight.
        drop(done_tx);
        while resolved < started {
            match done_rx.recv() {
                Ok(resolution) => {
                    resolved += 1;
                    report(resolution);
                }
                Err(_) => break,
            }
        }

        resolved
    }

    fn spawn_tick(&self, tick: u64, done: &channel::Sender<Resolution>) {
        let spawned = thread::Builder::new()
            .name(format!("requester_tick_{}", tick))
            .spawn({
                let connection = self.connection.clone();
                let config = self.config.clone();
                let done = done.clone();
                move || {
                    done.send(resolve(tick, &connection, &config)).ok();
                }
            });

        if let Err(err) = spawned {
            log::warn!("cannot spawn a thread for tick {}, running inline: {}", tick, err);
            done.send(resolve(tick, &self.connection, &self.config)).ok();
        }
    }
}

fn resolve(tick: u64, connection: &Connection, config: &RequesterConfig) -> Resolution {
    let start = Instant::now();
    let result = connection.request(&config.subject, &config.payload, config.timeout);
    Resolution {
        tick,
        elapsed: start.elapsed(),
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestErrorKind;
    use crate::Payload;

    #[test]
    fn defaults() {
        let config = RequesterConfig::default();
        assert_eq!(config.subject, "frame");
        assert_eq!(config.payload, b"1");
        assert_eq!(config.timeout, Duration::from_millis(1000));
        assert_eq!(config.interval, Duration::from_millis(2000));
        assert_eq!(config.max_ticks, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation() {
        let kind = |config: RequesterConfig| config.validate().unwrap_err().kind();

        assert_eq!(
            kind(RequesterConfig::default().subject("")),
            ConfigErrorKind::EmptySubject
        );
        assert_eq!(
            kind(RequesterConfig::default().subject("two words")),
            ConfigErrorKind::InvalidSubject
        );
        assert_eq!(
            kind(RequesterConfig::default().subject("frame..1")),
            ConfigErrorKind::InvalidSubject
        );
        assert_eq!(
            kind(RequesterConfig::default().timeout(Duration::ZERO)),
            ConfigErrorKind::InvalidTimeout
        );
        assert_eq!(
            kind(RequesterConfig::default().interval(Duration::ZERO)),
            ConfigErrorKind::InvalidInterval
        );
    }

    #[test]
    fn invalid_subject_error_names_the_subject() {
        let err = RequesterConfig::default()
            .subject("a b")
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid subject: \"a b\"");
    }

    #[test]
    fn logging_every_kind_of_resolution() {
        let _ = env_logger::builder().is_test(true).try_init();

        let resolutions = vec![
            Resolution {
                tick: 1,
                elapsed: Duration::from_millis(3),
                result: Ok(Outcome::Reply(Payload::Bytes(b"1".to_vec()))),
            },
            Resolution {
                tick: 2,
                elapsed: Duration::from_millis(1000),
                result: Ok(Outcome::Timeout),
            },
            Resolution {
                tick: 3,
                elapsed: Duration::from_millis(12),
                result: Err(RequestError::new(RequestErrorKind::Transport)),
            },
        ];
        for resolution in &resolutions {
            log_resolution(resolution);
        }
        assert_eq!(resolutions[1].elapsed_ms(), 1000);
    }
}
