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

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as channel;
use crossbeam_channel::RecvTimeoutError;

use crate::client::Client;
use crate::message::Message;

#[derive(Debug)]
struct Inner {
    /// Subscription ID.
    sid: u64,

    /// Subject.
    subject: String,

    /// MSG operations received from the server.
    messages: channel::Receiver<Message>,

    /// Client associated with subscription.
    client: Client,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.client.unsubscribe(self.sid).ok();
    }
}

/// A `Subscription` receives `Message`s published to a specific subject.
///
/// The subscription is removed from the server when the last clone is
/// dropped.
#[derive(Clone, Debug)]
pub struct Subscription(Arc<Inner>);

impl Subscription {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        messages: channel::Receiver<Message>,
        client: Client,
    ) -> Subscription {
        Subscription(Arc::new(Inner {
            sid,
            subject,
            messages,
            client,
        }))
    }

    /// The subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.0.subject
    }

    /// Get the next message, or None if the subscription
    /// has been unsubscribed or the connection closed.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// # let sub = nc.subscribe("frame")?;
    /// if let Some(msg) = sub.next() {}
    /// # Ok(())
    /// # }
    /// ```
    pub fn next(&self) -> Option<Message> {
        self.0.messages.recv().ok()
    }

    /// Try to get the next message, or None if no messages
    /// are present or if the subscription has been unsubscribed
    /// or the connection closed.
    pub fn try_next(&self) -> Option<Message> {
        self.0.messages.try_recv().ok()
    }

    /// Get the next message, or an error if none arrived within `timeout`.
    ///
    /// `RecvTimeoutError::Disconnected` means no message can arrive anymore:
    /// the subscription reached its limit or the connection is gone.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// # let sub = nc.subscribe("frame")?;
    /// if let Ok(msg) = sub.next_timeout(std::time::Duration::from_secs(1)) {}
    /// # Ok(())
    /// # }
    /// ```
    pub fn next_timeout(&self, timeout: Duration) -> Result<Message, RecvTimeoutError> {
        self.0.messages.recv_timeout(timeout)
    }

    /// Returns a blocking message iterator.
    pub fn messages(&self) -> Iter<'_> {
        Iter { subscription: self }
    }

    /// Tells the server to drop this subscription after `max_msgs` messages
    /// in total have been delivered on it.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// let sub = nc.subscribe("frame")?;
    /// sub.auto_unsubscribe(1)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn auto_unsubscribe(&self, max_msgs: u64) -> io::Result<()> {
        self.0.client.auto_unsubscribe(self.0.sid, max_msgs)
    }

    /// Unsubscribe a subscription immediately.
    pub fn unsubscribe(self) -> io::Result<()> {
        self.0.client.unsubscribe(self.0.sid)
    }
}

/// A blocking iterator over messages from a `Subscription`.
pub struct Iter<'a> {
    subscription: &'a Subscription,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.subscription.next()
    }
}
