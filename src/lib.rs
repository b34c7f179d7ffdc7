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

//! A small synchronous NATS client built around one operation: a request
//! that waits a bounded time for a single reply, issued again and again on a
//! fixed schedule.
//!
//! The client speaks the core NATS text protocol over plain TCP. It does not
//! reconnect, authenticate or use TLS.
//!
//! ## Examples
//!
//! ### Request/Response
//!
//! ```no_run
//! # use std::time::Duration;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use nats_requester::Outcome;
//!
//! let nc = nats_requester::connect("127.0.0.1:4222")?;
//! match nc.request("frame", "1", Duration::from_millis(1000))? {
//!     Outcome::Reply(payload) => println!("reply: {}", payload),
//!     Outcome::Timeout => println!("request timed out"),
//! }
//! # Ok(()) }
//! ```
//!
//! ### Periodic requests
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use nats_requester::requester::{Requester, RequesterConfig};
//!
//! let nc = nats_requester::connect("127.0.0.1:4222")?;
//! let requester = Requester::new(nc, RequesterConfig::default().max_ticks(5))?;
//! requester.run();
//! # Ok(()) }
//! ```
//!
//! ### Responding
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! let nc = nats_requester::connect("127.0.0.1:4222")?;
//! let sub = nc.queue_subscribe("frame", "responders")?;
//! for msg in sub.messages() {
//!     msg.respond(&msg.data)?;
//! }
//! # Ok(()) }
//! ```

#![deny(nonstandard_style, rust_2018_idioms, unsafe_code)]

mod client;
mod connect;
mod connector;
mod error;
mod message;
mod options;
mod proto;
pub mod requester;
mod subscription;

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::Deserialize;

pub use connector::ServerAddress;
pub use error::{ConfigError, ConfigErrorKind, RequestError, RequestErrorKind};
pub use message::{Message, Payload};
pub use options::Options;
pub use subscription::{Iter, Subscription};

#[doc(hidden)]
pub use connect::ConnectInfo;

use client::Client;

/// Boxed error used as the source of kind-tagged errors.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LANG: &str = "rust";
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Information sent by the server back to this client
/// during initial connection, and possibly again later.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// The unique identifier of the NATS server.
    pub server_id: String,
    /// Generated Server Name.
    pub server_name: String,
    /// The host specified in the cluster parameter/options.
    pub host: String,
    /// The port number specified in the cluster parameter/options.
    pub port: u16,
    /// The version of the NATS server.
    pub version: String,
    /// If this is set, then the server should try to authenticate upon
    /// connect.
    pub auth_required: bool,
    /// If this is set, then the server must authenticate using TLS.
    pub tls_required: bool,
    /// Maximum payload size that the server will accept.
    pub max_payload: usize,
    /// The protocol version in use.
    pub proto: i8,
    /// The server-assigned client ID.
    pub client_id: u64,
    /// The version of golang the NATS server was built with.
    pub go: String,
    /// A list of server urls that a client can connect to. Not used.
    pub connect_urls: Vec<String>,
    /// The client IP as known by the server.
    pub client_ip: String,
    /// Whether the server supports headers.
    pub headers: bool,
    /// Whether server goes into lame duck mode.
    #[serde(rename = "ldm")]
    pub lame_duck_mode: bool,
}

impl ServerInfo {
    fn parse(s: &str) -> Option<ServerInfo> {
        serde_json::from_str(s.trim())
            .map_err(|err| log::debug!("malformed INFO: {}", err))
            .ok()
    }
}

/// How a request ended when the connection stayed usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A reply arrived before the deadline.
    Reply(Payload),
    /// The deadline elapsed without a reply.
    Timeout,
}

impl Outcome {
    /// Returns `true` for [`Outcome::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Outcome::Timeout)
    }
}

/// A NATS connection.
///
/// Clones share the same underlying session; it is closed when the last
/// clone is dropped.
#[derive(Clone, Debug)]
pub struct Connection(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    client: Client,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.client.close();
    }
}

/// Connect to a NATS server at the given URL.
///
/// If no scheme is provided the `nats://` scheme is assumed. The default port
/// is `4222`. For more control over the connection use [`Options::connect()`].
///
/// # Example
/// ```no_run
/// let nc = nats_requester::connect("127.0.0.1:4222")?;
/// # Ok::<(), std::io::Error>(())
/// ```
pub fn connect(nats_url: &str) -> io::Result<Connection> {
    Options::new().connect(nats_url)
}

/// Returns true if `subject` can be published to: non-empty, free of
/// whitespace, and without empty tokens.
pub(crate) fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && !subject.chars().any(char::is_whitespace)
        && subject.split('.').all(|token| !token.is_empty())
}

impl Connection {
    pub(crate) fn connect_with_options(nats_url: &str, options: Options) -> io::Result<Connection> {
        let server: ServerAddress = nats_url.parse()?;
        let client = Client::connect(&server, options)?;
        Ok(Connection(Arc::new(Inner { client })))
    }

    /// Create a subscription for the given NATS connection.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// let sub = nc.subscribe("frame")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn subscribe(&self, subject: &str) -> io::Result<Subscription> {
        self.do_subscribe(subject, None)
    }

    /// Create a queue subscription for the given NATS connection.
    pub fn queue_subscribe(&self, subject: &str, queue: &str) -> io::Result<Subscription> {
        self.do_subscribe(subject, Some(queue))
    }

    /// Publish a message on the given subject.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// nc.publish("frame", "1")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn publish(&self, subject: &str, msg: impl AsRef<[u8]>) -> io::Result<()> {
        self.0.client.publish(subject, None, msg.as_ref())
    }

    /// Publish a message on the given subject with a reply subject for
    /// responses.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// let reply = nc.new_inbox();
    /// let rsub = nc.subscribe(&reply)?;
    /// nc.publish_request("frame", &reply, "1")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        msg: impl AsRef<[u8]>,
    ) -> io::Result<()> {
        self.0.client.publish(subject, Some(reply), msg.as_ref())
    }

    /// Create a new globally unique inbox which can be used for replies.
    pub fn new_inbox(&self) -> String {
        format!("_INBOX.{}", nuid::next())
    }

    /// Publish a request and wait up to `timeout` for a single reply.
    ///
    /// Every call listens on its own inbox, so concurrent requests on one
    /// connection never see each other's replies. A reply that arrives after
    /// the call returned is discarded.
    ///
    /// # Errors
    ///
    /// * [`RequestErrorKind::InvalidSubject`] for an empty or malformed subject.
    /// * [`RequestErrorKind::InvalidTimeout`] for a zero timeout.
    /// * [`RequestErrorKind::Transport`] if the connection is closed, or is
    ///   lost before a reply or the deadline.
    ///
    /// # Example
    /// ```no_run
    /// # use std::time::Duration;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// let outcome = nc.request("frame", "1", Duration::from_secs(1))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn request(
        &self,
        subject: &str,
        msg: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Outcome, RequestError> {
        if !is_valid_subject(subject) {
            return Err(RequestError::new(RequestErrorKind::InvalidSubject));
        }
        if timeout.is_zero() {
            return Err(RequestError::new(RequestErrorKind::InvalidTimeout));
        }

        let transport = |err: io::Error| RequestError::with_source(RequestErrorKind::Transport, err);

        let inbox = self.new_inbox();
        let sub = self.subscribe(&inbox).map_err(transport)?;
        sub.auto_unsubscribe(1).map_err(transport)?;
        self.publish_request(subject, &inbox, msg).map_err(transport)?;
        log::trace!("request on {} waiting on {}", subject, inbox);

        // Dropping `sub` on return removes the inbox, so a late reply finds
        // no one to deliver to.
        match sub.next_timeout(timeout) {
            Ok(msg) => Ok(Outcome::Reply(Payload::decode(
                msg.data,
                self.0.client.options.preserve_buffers,
            ))),
            Err(RecvTimeoutError::Timeout) => Ok(Outcome::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(transport(io::Error::new(
                ErrorKind::ConnectionReset,
                "connection lost while waiting for a reply",
            ))),
        }
    }

    /// Flush a NATS connection by sending a `PING` protocol and waiting for the
    /// responding `PONG`. Will fail with `TimedOut` if the server does not
    /// respond within 10 seconds.
    pub fn flush(&self) -> io::Result<()> {
        self.flush_timeout(DEFAULT_FLUSH_TIMEOUT)
    }

    /// Like [`Connection::flush`], with a custom deadline.
    pub fn flush_timeout(&self, duration: Duration) -> io::Result<()> {
        self.0.client.flush(duration)
    }

    /// Calculates the round trip time between this client and the server.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// println!("server rtt: {:?}", nc.rtt());
    /// # Ok(())
    /// # }
    /// ```
    pub fn rtt(&self) -> io::Result<Duration> {
        let start = Instant::now();
        self.flush()?;
        Ok(start.elapsed())
    }

    /// Server info as received by the most recent INFO message.
    pub fn server_info(&self) -> ServerInfo {
        self.0.client.server_info()
    }

    /// Returns the maximum payload size the server will accept.
    pub fn max_payload(&self) -> usize {
        self.0.client.server_info().max_payload
    }

    /// Returns true once the connection was closed or lost. It does not
    /// recover.
    pub fn is_closed(&self) -> bool {
        self.0.client.is_closed()
    }

    /// Close a NATS connection. All clones of this `Connection` will also be
    /// closed, as the backing IO threads are shared.
    ///
    /// Buffered messages are flushed first.
    pub fn close(self) {
        self.0.client.flush(DEFAULT_FLUSH_TIMEOUT).ok();
        self.0.client.close();
    }

    fn do_subscribe(&self, subject: &str, queue: Option<&str>) -> io::Result<Subscription> {
        let (sid, receiver) = self.0.client.subscribe(subject, queue)?;
        Ok(Subscription::new(
            sid,
            subject.to_string(),
            receiver,
            self.0.client.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_validation() {
        assert!(is_valid_subject("frame"));
        assert!(is_valid_subject("frames.camera-1"));
        assert!(is_valid_subject("_INBOX.abc"));
        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("frame one"));
        assert!(!is_valid_subject("frame\t"));
        assert!(!is_valid_subject("frames..one"));
        assert!(!is_valid_subject(".frame"));
        assert!(!is_valid_subject("frame."));
    }

    #[test]
    fn server_info_defaults_missing_fields() {
        let info = ServerInfo::parse(r#" {"server_id":"abc","max_payload":1048576,"ldm":true}"#)
            .unwrap();
        assert_eq!(info.server_id, "abc");
        assert_eq!(info.max_payload, 1_048_576);
        assert!(info.lame_duck_mode);
        assert!(!info.tls_required);
        assert!(info.connect_urls.is_empty());
    }

    #[test]
    fn server_info_rejects_garbage() {
        assert!(ServerInfo::parse("{not json").is_none());
    }
}
