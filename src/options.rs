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

use std::fmt;
use std::io::{self, Error};
use std::time::Duration;

use crate::Connection;

type ErrorCallback = Box<dyn Fn(Error) + Send + Sync + 'static>;
type CloseCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Connect options.
pub struct Options {
    pub(crate) name: Option<String>,
    pub(crate) no_echo: bool,
    pub(crate) preserve_buffers: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u8,

    error_callback: Option<ErrorCallback>,
    close_callback: Option<CloseCallback>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("no_echo", &self.no_echo)
            .field("preserve_buffers", &self.preserve_buffers)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("error_callback_set", &self.error_callback.is_some())
            .field("close_callback_set", &self.close_callback.is_some())
            .finish()
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            name: None,
            no_echo: false,
            preserve_buffers: true,
            connect_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(2 * 60),
            max_pings_out: 2,
            error_callback: None,
            close_callback: None,
        }
    }
}

impl Options {
    /// `Options` for establishing a new NATS `Connection`.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// let options = nats_requester::Options::new();
    /// let nc = options.connect("127.0.0.1:4222")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new() -> Options {
        Options::default()
    }

    /// Add a name option to this configuration.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// let nc = nats_requester::Options::new()
    ///     .with_name("frame poller")
    ///     .connect("127.0.0.1:4222")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_name(mut self, name: &str) -> Options {
        self.name = Some(name.to_string());
        self
    }

    /// Select option to not deliver messages that we have published.
    pub fn no_echo(mut self) -> Options {
        self.no_echo = true;
        self
    }

    /// Whether reply payloads are handed out as raw bytes (`true`, the
    /// default) or decoded into text.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// let nc = nats_requester::Options::new()
    ///     .preserve_buffers(false)
    ///     .connect("127.0.0.1:4222")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn preserve_buffers(mut self, preserve_buffers: bool) -> Options {
        self.preserve_buffers = preserve_buffers;
        self
    }

    /// How long to wait for the TCP connection and the server handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Options {
        self.connect_timeout = timeout;
        self
    }

    /// How often to ping an otherwise idle server. The connection is
    /// considered stale after two unanswered pings.
    pub fn ping_interval(mut self, interval: Duration) -> Options {
        self.ping_interval = interval;
        self
    }

    /// Establish a `Connection` with a NATS server.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// let options = nats_requester::Options::new();
    /// let nc = options.connect("nats://127.0.0.1:4222")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(self, nats_url: &str) -> io::Result<Connection> {
        Connection::connect_with_options(nats_url, self)
    }

    /// Set a callback to be executed when an async error from
    /// a server has been received.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// let nc = nats_requester::Options::new()
    ///     .error_callback(|err| log::error!("server error: {}", err))
    ///     .connect("127.0.0.1:4222")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn error_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.error_callback = Some(Box::new(cb));
        self
    }

    /// Set a callback to be executed when the client has been closed,
    /// either by `close` or because the connection was lost.
    pub fn close_callback<F>(mut self, cb: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close_callback = Some(Box::new(cb));
        self
    }

    /// Hands a server `-ERR` to the error callback, or logs it when none
    /// is set.
    pub(crate) fn report_error(&self, client_id: u64, err: Error) {
        match &self.error_callback {
            Some(callback) => callback(err),
            None => log::error!("{} on connection [{}]", err, client_id),
        }
    }

    pub(crate) fn notify_closed(&self) {
        if let Some(callback) = &self.close_callback {
            callback();
        }
    }
}
