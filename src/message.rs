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

use std::{fmt, io};

use crate::client::Client;

pub(crate) const MESSAGE_NOT_BOUND: &str = "message not bound to a connection";

/// A message received on a subject.
#[derive(Clone)]
pub struct Message {
    /// The subject this message came from.
    pub subject: String,

    /// Optional reply subject that may be used for sending a response to this
    /// message.
    pub reply: Option<String>,

    /// The message contents.
    pub data: Vec<u8>,

    /// Client for publishing on the reply subject.
    pub(crate) client: Option<Client>,
}

impl Message {
    /// Creates new `Message` that is not bound to a connection. Such a
    /// message can be inspected but not responded to.
    pub fn new(subject: &str, reply: Option<&str>, data: impl AsRef<[u8]>) -> Message {
        Message {
            subject: subject.to_string(),
            reply: reply.map(String::from),
            data: data.as_ref().to_vec(),
            client: None,
        }
    }

    /// Respond to a request message.
    ///
    /// # Example
    /// ```no_run
    /// # fn main() -> std::io::Result<()> {
    /// # let nc = nats_requester::connect("127.0.0.1:4222")?;
    /// let sub = nc.subscribe("frame")?;
    /// for msg in sub.messages() {
    ///     msg.respond(&msg.data)?;
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn respond(&self, msg: impl AsRef<[u8]>) -> io::Result<()> {
        let reply = self.reply.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "No reply subject to reply to")
        })?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, MESSAGE_NOT_BOUND))?;
        client.publish(reply.as_str(), None, msg.as_ref())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("length", &self.data.len())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let mut body = format!("[{} bytes]", self.data.len());
        if let Ok(str) = std::str::from_utf8(&self.data) {
            body = str.to_string();
        }
        if let Some(reply) = &self.reply {
            write!(
                f,
                "Message {{\n  subject: \"{}\",\n  reply: \"{}\",\n  data: \"{}\"\n}}",
                self.subject, reply, body
            )
        } else {
            write!(
                f,
                "Message {{\n  subject: \"{}\",\n  data: \"{}\"\n}}",
                self.subject, body
            )
        }
    }
}

/// The body of a reply as handed to the caller.
///
/// Which variant is produced depends on the connection's
/// [`Options::preserve_buffers`](crate::Options::preserve_buffers) setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// The raw bytes, untouched.
    Bytes(Vec<u8>),
    /// The bytes decoded as UTF-8; invalid sequences are replaced.
    Text(String),
}

impl Payload {
    pub(crate) fn decode(data: Vec<u8>, preserve_buffers: bool) -> Payload {
        if preserve_buffers {
            return Payload::Bytes(data);
        }
        match String::from_utf8(data) {
            Ok(text) => Payload::Text(text),
            Err(err) => Payload::Text(String::from_utf8_lossy(err.as_bytes()).into_owned()),
        }
    }

    /// The payload as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    /// Consumes the payload, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.into_bytes(),
        }
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => write!(f, "b\"{}\"", bytes.escape_ascii()),
            Payload::Text(text) => write!(f, "{:?}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decoding() {
        assert_eq!(
            Payload::decode(b"1".to_vec(), true),
            Payload::Bytes(b"1".to_vec())
        );
        assert_eq!(
            Payload::decode(b"1".to_vec(), false),
            Payload::Text("1".to_string())
        );
        assert_eq!(
            Payload::decode(vec![b'a', 0xff], false),
            Payload::Text("a\u{fffd}".to_string())
        );
    }

    #[test]
    fn payload_display() {
        assert_eq!(Payload::Bytes(b"1\n".to_vec()).to_string(), "b\"1\\n\"");
        assert_eq!(Payload::Text("1".to_string()).to_string(), "\"1\"");
    }

    #[test]
    fn unbound_message_cannot_respond() {
        let msg = Message::new("frame", Some("_INBOX.abc"), "1");
        let err = msg.respond("2").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let msg = Message::new("frame", None, "1");
        let err = msg.respond("2").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
