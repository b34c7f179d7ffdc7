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
use std::io::prelude::*;
use std::io::{self, BufReader, Error, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use url::{Host, Url};

use crate::connect::ConnectInfo;
use crate::proto::{self, ClientOp, ServerOp};
use crate::{Options, ServerInfo};

/// A handshaken connection: the server's INFO, a reader that may already hold
/// buffered server operations, and the write half.
pub(crate) type Connected = (ServerInfo, BufReader<TcpStream>, TcpStream);

/// Establishes the connection to a single server.
///
/// Every resolved socket address is tried once, in random order; the first
/// one that completes the handshake wins.
pub(crate) struct Connector<'a> {
    server: &'a ServerAddress,
    options: &'a Options,
}

impl<'a> Connector<'a> {
    pub(crate) fn new(server: &'a ServerAddress, options: &'a Options) -> Connector<'a> {
        Connector { server, options }
    }

    /// Creates a new connection to the server.
    pub(crate) fn connect(&self) -> io::Result<Connected> {
        // The last seen error, which gets returned if all connect attempts
        // fail.
        let mut last_err = Error::new(ErrorKind::AddrNotAvailable, "no socket addresses");

        let mut addrs = self.server.socket_addrs()?.collect::<Vec<_>>();
        fastrand::shuffle(&mut addrs);

        for addr in addrs {
            match self.connect_addr(addr) {
                Ok(connected) => return Ok(connected),
                Err(err) => {
                    log::debug!("connecting to {} failed: {}", addr, err);
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    /// Attempts to establish a connection to a single socket address.
    fn connect_addr(&self, addr: SocketAddr) -> io::Result<Connected> {
        let timeout = self.options.connect_timeout;

        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        // Bound the handshake; cleared once the server has answered.
        stream.set_read_timeout(Some(timeout))?;

        // Expect an INFO message.
        let mut line = Vec::with_capacity(1024);
        while !line.ends_with(b"\r\n") {
            let byte = &mut [0];
            stream.read_exact(byte)?;
            line.push(byte[0]);
        }
        let server_info = match proto::decode(&line[..])? {
            Some(ServerOp::Info(server_info)) => server_info,
            Some(op) => {
                return Err(Error::new(
                    ErrorKind::Other,
                    format!("expected INFO, received: {:?}", op),
                ));
            }
            None => {
                return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed"));
            }
        };

        if server_info.tls_required {
            return Err(Error::new(
                ErrorKind::Unsupported,
                "server requires TLS, which this client does not speak",
            ));
        }

        let connect_info = ConnectInfo::new(self.options.name.clone(), !self.options.no_echo);

        // Send CONNECT and PING messages.
        proto::encode(&mut stream, ClientOp::Connect(&connect_info))?;
        proto::encode(&mut stream, ClientOp::Ping)?;
        stream.flush()?;

        let mut reader = BufReader::new(stream.try_clone()?);

        // Wait for a PONG.
        loop {
            match proto::decode(&mut reader)? {
                // If we get PONG, the server is happy and we're done
                // connecting.
                Some(ServerOp::Pong) => break,

                // Respond to a PING with a PONG.
                Some(ServerOp::Ping) => {
                    proto::encode(&mut stream, ClientOp::Pong)?;
                    stream.flush()?;
                }

                Some(ServerOp::Err(msg)) => {
                    return Err(Error::new(
                        ErrorKind::ConnectionRefused,
                        format!("server rejected connection: {}", msg),
                    ));
                }

                // No other operations should arrive at this time.
                Some(op) => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("unexpected line while connecting: {:?}", op),
                    ));
                }

                // Error if the connection was closed.
                None => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed while waiting for the first PONG",
                    ));
                }
            }
        }

        stream.set_read_timeout(None::<Duration>)?;

        Ok((server_info, reader, stream))
    }
}

/// Address of a NATS server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress(Url);

impl FromStr for ServerAddress {
    type Err = Error;

    /// Parse an address of a NATS server.
    ///
    /// If not stated explicitly the `nats://` schema and port `4222` is assumed.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url: Url = if input.contains("://") {
            input.parse()
        } else {
            format!("nats://{}", input).parse()
        }
        .map_err(|e| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("NATS server URL is invalid: {}", e),
            )
        })?;

        Self::from_url(url)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.host() {
            Some(Host::Ipv6(_)) => write!(f, "nats://[{}]:{}", self.host(), self.port()),
            _ => write!(f, "nats://{}:{}", self.host(), self.port()),
        }
    }
}

impl ServerAddress {
    /// Check if the URL is a valid NATS server address.
    pub fn from_url(url: Url) -> io::Result<Self> {
        if url.scheme() != "nats" {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid scheme for NATS server URL: {}", url.scheme()),
            ));
        }

        if url.host().is_none() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "NATS server URL has no host",
            ));
        }

        Ok(Self(url))
    }

    /// Turn the server address into a standard URL.
    pub fn into_inner(self) -> Url {
        self.0
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        match self.0.host() {
            Some(Host::Domain(host)) => host,
            // `host_str()` for Ipv6 includes the []s
            Some(Host::Ipv6(_)) => self
                .0
                .host_str()
                .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or_default(),
            Some(Host::Ipv4(_)) => self.0.host_str().unwrap_or_default(),
            None => "",
        }
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.0.port().unwrap_or(4222)
    }

    /// Return the sockets from resolving the server address.
    pub fn socket_addrs(&self) -> io::Result<impl Iterator<Item = SocketAddr>> {
        (self.host(), self.port()).to_socket_addrs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_address_ipv6() {
        let address = ServerAddress::from_str("nats://[::]").unwrap();
        assert_eq!(address.host(), "::")
    }

    #[test]
    fn server_address_ipv4() {
        let address = ServerAddress::from_str("nats://192.168.0.254:4222").unwrap();
        assert_eq!(address.host(), "192.168.0.254");
        assert_eq!(address.port(), 4222);
    }

    #[test]
    fn server_address_domain() {
        let address = ServerAddress::from_str("nats://example.com").unwrap();
        assert_eq!(address.host(), "example.com")
    }

    #[test]
    fn server_address_default_scheme_and_port() {
        let address = ServerAddress::from_str("localhost").unwrap();
        assert_eq!(address.host(), "localhost");
        assert_eq!(address.port(), 4222);
        assert_eq!(address.to_string(), "nats://localhost:4222");
    }

    #[test]
    fn server_address_explicit_port() {
        let address = ServerAddress::from_str("127.0.0.1:14222").unwrap();
        assert_eq!(address.port(), 14222);
    }

    #[test]
    fn server_address_rejects_other_schemes() {
        let err = ServerAddress::from_str("http://localhost:4222").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = ServerAddress::from_str("tls://localhost:4222").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn server_address_rejects_garbage() {
        let err = ServerAddress::from_str("nats://localhost:99999").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
