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

use serde::Serialize;

/// Info to construct a CONNECT message.
#[derive(Clone, Debug, Serialize)]
#[doc(hidden)]
pub struct ConnectInfo {
    /// Turns on +OK protocol acknowledgements.
    pub verbose: bool,

    /// Turns on additional strict format checking, e.g. for properly formed
    /// subjects.
    pub pedantic: bool,

    /// Optional client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// If set to `false`, the server will not send originating messages from
    /// this connection to its own subscriptions.
    pub echo: bool,

    /// The implementation language of the client.
    pub lang: String,

    /// The version of the client.
    pub version: String,

    /// Sending 0 (or absent) indicates client supports original protocol.
    /// Sending 1 indicates that the client supports asynchronously receiving
    /// INFO messages.
    pub protocol: u8,

    /// Indicates whether the client requires an SSL connection.
    pub tls_required: bool,

    /// Whether the client supports the usage of headers.
    pub headers: bool,

    /// Whether the client wants the server to answer requests that have no
    /// subscribers with a status message.
    pub no_responders: bool,
}

impl ConnectInfo {
    pub(crate) fn new(name: Option<String>, echo: bool) -> ConnectInfo {
        ConnectInfo {
            verbose: false,
            pedantic: false,
            name,
            echo,
            lang: crate::LANG.to_string(),
            version: crate::VERSION.to_string(),
            protocol: 1,
            tls_required: false,
            // Unanswered requests time out; no status replies.
            headers: false,
            no_responders: false,
        }
    }
}
