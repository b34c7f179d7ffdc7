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

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nats_requester::requester::{Requester, RequesterConfig};
use nats_requester::{Options, ServerAddress};

/// Requests on a NATS subject at a fixed interval, or answers such requests.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// The NATS server URL
    #[arg(
        short,
        long,
        env = "NATS_URL",
        default_value = "nats://127.0.0.1:4222"
    )]
    server: ServerAddress,

    /// Client name reported to the server
    #[arg(long, default_value = "nats-requester")]
    name: String,

    /// Decode payloads as text instead of keeping the raw bytes
    #[arg(long)]
    text: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sends a request every interval and logs how it resolved
    Request {
        #[arg(long, default_value = "frame")]
        subject: String,
        #[arg(long, default_value = "1")]
        payload: String,
        /// How long each request waits for its reply
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Time between two requests
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
        /// Stop after this many requests
        #[arg(long)]
        count: Option<u64>,
    },
    /// Listens for requests and replies to each of them
    Reply {
        #[arg(long, default_value = "frame")]
        subject: String,
        /// Reply body; the request body is echoed when omitted
        #[arg(long)]
        payload: Option<String>,
        /// Queue group to join
        #[arg(long)]
        queue: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), nats_requester::Error> {
    let options = Options::new()
        .with_name(&cli.name)
        .preserve_buffers(!cli.text);

    match cli.command {
        Commands::Request {
            subject,
            payload,
            timeout_ms,
            interval_ms,
            count,
        } => {
            let mut config = RequesterConfig::default()
                .subject(&subject)
                .payload(payload)
                .timeout(Duration::from_millis(timeout_ms))
                .interval(Duration::from_millis(interval_ms));
            config.max_ticks = count;
            // Fail on a bad configuration before touching the network.
            config.validate()?;

            let nc = options.connect(&cli.server.to_string())?;
            log::info!("connected to {}", cli.server);

            let requester = Requester::new(nc.clone(), config)?;
            let resolved = requester.run();
            log::debug!("{} requests resolved", resolved);
            nc.close();
        }
        Commands::Reply {
            subject,
            payload,
            queue,
        } => {
            let nc = options.connect(&cli.server.to_string())?;
            log::info!("connected to {}", cli.server);

            let sub = match &queue {
                Some(queue) => nc.queue_subscribe(&subject, queue)?,
                None => nc.subscribe(&subject)?,
            };
            log::info!("listening for requests on {}", subject);

            for msg in sub.messages() {
                log::debug!("request on {} with {} bytes", msg.subject, msg.data.len());
                let res = match &payload {
                    Some(payload) => msg.respond(payload),
                    None => msg.respond(&msg.data),
                };
                if let Err(err) = res {
                    log::warn!("cannot reply on {}: {}", msg.subject, err);
                }
            }
            log::warn!("connection closed, no more requests");
        }
    }

    Ok(())
}
