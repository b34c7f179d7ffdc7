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

use std::io::prelude::*;
use std::io::{self, Error, ErrorKind};
use std::str::{self, FromStr};

use crate::connect::ConnectInfo;
use crate::ServerInfo;

/// Longest control line accepted from the server.
const MAX_CONTROL_LINE: usize = 4096;

/// A protocol operation sent by the server.
#[derive(Debug)]
pub(crate) enum ServerOp {
    /// `INFO {["option_name":option_value],...}`
    Info(ServerInfo),

    /// `MSG <subject> <sid> [reply-to] <#bytes>\r\n[payload]\r\n`
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        payload: Vec<u8>,
    },

    /// `PING`
    Ping,

    /// `PONG`
    Pong,

    /// `+OK`
    Ok,

    /// `-ERR <error message>`
    Err(String),

    /// Unknown protocol message.
    Unknown(String),
}

// Like `BufRead::read_until` with b'\n', but bounded by a fixed buffer so a
// misbehaving server can't make us allocate without limit.
fn read_line<R: BufRead + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    loop {
        let available = match r.fill_buf() {
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let (done, len) = match memchr::memchr(b'\n', available) {
            Some(i) => (true, i + 1),
            None => (false, available.len()),
        };
        if read + len > buf.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "received command exceeded fixed command buffer",
            ));
        }
        buf[read..read + len].copy_from_slice(&available[..len]);
        r.consume(len);
        read += len;
        if done || len == 0 {
            return Ok(read);
        }
    }
}

/// Decodes a single operation from the server.
///
/// If the connection is closed, `None` will be returned.
pub(crate) fn decode(mut stream: impl BufRead) -> io::Result<Option<ServerOp>> {
    let mut command_buf = [0_u8; MAX_CONTROL_LINE];

    let command_len = read_line(&mut stream, &mut command_buf)?;
    if command_len == 0 {
        return Ok(None);
    }

    let line = str::from_utf8(&command_buf[..command_len])
        .map_err(|err| Error::new(ErrorKind::InvalidInput, err))?;

    let op = line
        .split_ascii_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match op.as_str() {
        "PING" => Ok(Some(ServerOp::Ping)),
        "PONG" => Ok(Some(ServerOp::Pong)),
        "+OK" => Ok(Some(ServerOp::Ok)),
        "INFO" => {
            let server_info = ServerInfo::parse(&line["INFO".len()..]).ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "cannot parse server info")
            })?;
            Ok(Some(ServerOp::Info(server_info)))
        }
        "MSG" => decode_msg(&line["MSG".len()..], &mut stream).map(Some),
        "-ERR" => {
            let msg = line["-ERR".len()..].trim().trim_matches('\'').to_string();
            Ok(Some(ServerOp::Err(msg)))
        }
        _ => Ok(Some(ServerOp::Unknown(line.trim_end().to_owned()))),
    }
}

fn decode_msg(args: &str, mut stream: impl BufRead) -> io::Result<ServerOp> {
    let args = args.split_whitespace().collect::<Vec<_>>();

    // `MSG <subject> <sid> [reply-to] <#bytes>`
    let (subject, sid, reply_to, num_bytes) = match args[..] {
        [subject, sid, num_bytes] => (subject, sid, None, num_bytes),
        [subject, sid, reply_to, num_bytes] => (subject, sid, Some(reply_to), num_bytes),
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "invalid number of arguments after MSG",
            ));
        }
    };

    let sid = u64::from_str(sid).map_err(|_| {
        Error::new(
            ErrorKind::InvalidInput,
            "cannot parse sid argument after MSG",
        )
    })?;

    let num_bytes = usize::from_str(num_bytes).map_err(|_| {
        Error::new(
            ErrorKind::InvalidInput,
            "cannot parse the number of bytes argument after MSG",
        )
    })?;

    let mut payload = vec![0_u8; num_bytes];
    stream.read_exact(&mut payload[..])?;
    // Read "\r\n".
    stream.read_exact(&mut [0_u8; 2])?;

    Ok(ServerOp::Msg {
        subject: subject.to_string(),
        sid,
        reply_to: reply_to.map(ToString::to_string),
        payload,
    })
}

/// A protocol operation sent by the client.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ClientOp<'a> {
    /// `CONNECT {["option_name":option_value],...}`
    Connect(&'a ConnectInfo),

    /// `PUB <subject> [reply-to] <#bytes>\r\n[payload]\r\n`
    Pub {
        subject: &'a str,
        reply_to: Option<&'a str>,
        payload: &'a [u8],
    },

    /// `SUB <subject> [queue group] <sid>\r\n`
    Sub {
        subject: &'a str,
        queue_group: Option<&'a str>,
        sid: u64,
    },

    /// `UNSUB <sid> [max_msgs]`
    Unsub { sid: u64, max_msgs: Option<u64> },

    /// `PING`
    Ping,

    /// `PONG`
    Pong,
}

/// Encodes a single operation from the client.
pub(crate) fn encode(mut stream: impl Write, op: ClientOp<'_>) -> io::Result<()> {
    match op {
        ClientOp::Connect(connect_info) => {
            let json = serde_json::to_string(connect_info)
                .map_err(|err| Error::new(ErrorKind::InvalidData, err))?;
            stream.write_all(b"CONNECT ")?;
            stream.write_all(json.as_bytes())?;
            stream.write_all(b"\r\n")?;
        }

        ClientOp::Pub {
            subject,
            reply_to,
            payload,
        } => {
            stream.write_all(b"PUB ")?;
            stream.write_all(subject.as_bytes())?;
            stream.write_all(b" ")?;

            if let Some(reply_to) = reply_to {
                stream.write_all(reply_to.as_bytes())?;
                stream.write_all(b" ")?;
            }

            let mut buf = itoa::Buffer::new();
            stream.write_all(buf.format(payload.len()).as_bytes())?;
            stream.write_all(b"\r\n")?;

            stream.write_all(payload)?;
            stream.write_all(b"\r\n")?;
        }

        ClientOp::Sub {
            subject,
            queue_group,
            sid,
        } => {
            let op = match queue_group {
                Some(queue_group) => format!("SUB {} {} {}\r\n", subject, queue_group, sid),
                None => format!("SUB {} {}\r\n", subject, sid),
            };
            stream.write_all(op.as_bytes())?;
        }

        ClientOp::Unsub { sid, max_msgs } => {
            let op = match max_msgs {
                Some(max_msgs) => format!("UNSUB {} {}\r\n", sid, max_msgs),
                None => format!("UNSUB {}\r\n", sid),
            };
            stream.write_all(op.as_bytes())?;
        }

        ClientOp::Ping => {
            stream.write_all(b"PING\r\n")?;
        }

        ClientOp::Pong => {
            stream.write_all(b"PONG\r\n")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<ServerOp> {
        let mut reader = io::BufReader::new(input);
        let mut ops = Vec::new();
        while let Some(op) = decode(&mut reader).unwrap() {
            ops.push(op);
        }
        ops
    }

    #[test]
    fn decode_msg_with_reply() {
        let ops = decode_all(b"MSG frame 7 _INBOX.abc 1\r\n1\r\n");
        match &ops[..] {
            [ServerOp::Msg {
                subject,
                sid,
                reply_to,
                payload,
            }] => {
                assert_eq!(subject, "frame");
                assert_eq!(*sid, 7);
                assert_eq!(reply_to.as_deref(), Some("_INBOX.abc"));
                assert_eq!(payload, b"1");
            }
            other => panic!("unexpected ops: {:?}", other),
        }
    }

    #[test]
    fn decode_empty_msg_payload() {
        let ops = decode_all(b"MSG _INBOX.abc 2 0\r\n\r\nPING\r\n");
        assert!(matches!(&ops[0], ServerOp::Msg { payload, reply_to: None, .. } if payload.is_empty()));
        assert!(matches!(ops[1], ServerOp::Ping));
    }

    #[test]
    fn decode_control_ops() {
        let ops = decode_all(b"PING\r\npong\r\n+OK\r\n-ERR 'Unknown Protocol Operation'\r\nWAT\r\n");
        assert!(matches!(ops[0], ServerOp::Ping));
        assert!(matches!(ops[1], ServerOp::Pong));
        assert!(matches!(ops[2], ServerOp::Ok));
        assert!(matches!(&ops[3], ServerOp::Err(msg) if msg == "Unknown Protocol Operation"));
        assert!(matches!(&ops[4], ServerOp::Unknown(line) if line == "WAT"));
    }

    #[test]
    fn decode_info() {
        let ops = decode_all(
            b"INFO {\"server_id\":\"test\",\"version\":\"2.10.0\",\"max_payload\":1024,\"proto\":1}\r\n",
        );
        match &ops[..] {
            [ServerOp::Info(info)] => {
                assert_eq!(info.server_id, "test");
                assert_eq!(info.max_payload, 1024);
            }
            other => panic!("unexpected ops: {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_bad_msg() {
        let mut reader = io::BufReader::new(&b"MSG frame\r\n"[..]);
        let err = decode(&mut reader).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn encode_ops() {
        let mut out = Vec::new();
        encode(
            &mut out,
            ClientOp::Pub {
                subject: "frame",
                reply_to: Some("_INBOX.abc"),
                payload: b"1",
            },
        )
        .unwrap();
        encode(
            &mut out,
            ClientOp::Sub {
                subject: "_INBOX.abc",
                queue_group: None,
                sid: 3,
            },
        )
        .unwrap();
        encode(
            &mut out,
            ClientOp::Unsub {
                sid: 3,
                max_msgs: Some(1),
            },
        )
        .unwrap();
        encode(&mut out, ClientOp::Ping).unwrap();
        assert_eq!(
            out,
            b"PUB frame _INBOX.abc 1\r\n1\r\nSUB _INBOX.abc 3\r\nUNSUB 3 1\r\nPING\r\n".to_vec()
        );
    }
}
