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

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::prelude::*;
use std::io::{self, BufReader, BufWriter, Error, ErrorKind};
use std::mem;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;

use crate::connector::{Connector, ServerAddress};
use crate::message::Message;
use crate::proto::{self, ClientOp, ServerOp};
use crate::{Options, ServerInfo};

const BUF_CAPACITY: usize = 32 * 1024;

/// Client state.
///
/// NB: locking protocol - writes must ALWAYS be locked
///     first and released after when both are used.
///     Failure to follow this strict rule WILL create
///     a deadlock!
struct State {
    write: Mutex<WriteState>,
    read: Mutex<ReadState>,
}

struct WriteState {
    /// Buffered writer with an active connection.
    ///
    /// When `None`, the connection has been lost or closed. It is never
    /// re-established.
    writer: Option<BufWriter<TcpStream>>,

    /// Signals to the flusher thread that the writer needs a flush.
    flush_kicker: channel::Sender<()>,

    /// Next subscription ID.
    next_sid: u64,
}

struct ReadState {
    /// Current subscriptions.
    subscriptions: HashMap<u64, Subscription>,

    /// Expected pongs and their notification channels.
    pongs: VecDeque<channel::Sender<()>>,

    /// Tracks the last activity from the server.
    last_active: Instant,

    /// Used for client side monitoring of connection health.
    pings_out: u8,
}

/// A registered subscription.
struct Subscription {
    subject: String,
    messages: channel::Sender<Message>,

    /// Set by an automatic unsubscribe; the subscription is dropped once
    /// `delivered` reaches it.
    max_msgs: Option<u64>,
    delivered: u64,
}

/// A NATS client.
#[derive(Clone)]
pub(crate) struct Client {
    /// Shared client state.
    state: Arc<State>,

    /// Server info provided by the last INFO message.
    server_info: Arc<Mutex<ServerInfo>>,

    /// Set to `true` if shutdown has been requested.
    shutdown: Arc<Mutex<bool>>,

    /// The options that this `Client` was created using.
    pub(crate) options: Arc<Options>,

    /// Handle of the reader thread.
    client_thread: Arc<Mutex<Option<JoinHandle<()>>>>,

    /// Handle of the flusher thread.
    flush_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Client {
    /// Connects to the server and starts the background threads.
    pub(crate) fn connect(server: &ServerAddress, options: Options) -> io::Result<Client> {
        let (server_info, reader, stream) = Connector::new(server, &options).connect()?;
        log::debug!(
            "connected to {} (server {} version {})",
            server,
            server_info.server_id,
            server_info.version
        );

        // A channel for coordinating flushes.
        let (flush_kicker, flush_wanted) = channel::bounded(1);

        let client = Client {
            state: Arc::new(State {
                write: Mutex::new(WriteState {
                    writer: Some(BufWriter::with_capacity(BUF_CAPACITY, stream)),
                    flush_kicker,
                    next_sid: 1,
                }),
                read: Mutex::new(ReadState {
                    subscriptions: HashMap::new(),
                    pongs: VecDeque::new(),
                    last_active: Instant::now(),
                    pings_out: 0,
                }),
            }),
            server_info: Arc::new(Mutex::new(server_info)),
            shutdown: Arc::new(Mutex::new(false)),
            options: Arc::new(options),
            client_thread: Arc::new(Mutex::new(None)),
            flush_thread: Arc::new(Mutex::new(None)),
        };

        // The reader thread:
        // - Reads operations from the server and processes them.
        // - Forwards MSG operations to subscribers.
        // - Tears the client down once the connection is gone.
        let handle = thread::Builder::new()
            .name("nats_requester_reader".to_string())
            .spawn({
                let client = client.clone();
                move || client.run(reader)
            })?;
        *client.client_thread.lock() = Some(handle);

        // The flusher thread batches writes and keeps an idle connection
        // alive with PINGs.
        let handle = thread::Builder::new()
            .name("nats_requester_flusher".to_string())
            .spawn({
                let client = client.clone();
                move || client.run_flusher(flush_wanted)
            })?;
        *client.flush_thread.lock() = Some(handle);

        Ok(client)
    }

    /// Retrieves server info as received by the most recent INFO message.
    pub(crate) fn server_info(&self) -> ServerInfo {
        self.server_info.lock().clone()
    }

    /// Makes a round trip to the server to ensure buffered messages reach it.
    pub(crate) fn flush(&self, timeout: Duration) -> io::Result<()> {
        let pong = {
            let mut write = self.state.write.lock();
            let mut read = self.state.read.lock();

            self.check_shutdown()?;

            let (sender, receiver) = channel::bounded(1);

            // Enqueue the expected PONG before the PING can be answered.
            // A timed-out flush keeps its slot; its PONG still arrives in order.
            read.pongs.push_back(sender);

            let res = write
                .writer
                .as_mut()
                .ok_or_else(connection_lost)
                .and_then(|writer| {
                    writer.get_ref().set_write_timeout(Some(timeout))?;
                    proto::encode(&mut *writer, ClientOp::Ping)?;
                    writer.flush()?;
                    writer.get_ref().set_write_timeout(None)
                });
            if let Err(err) = res {
                read.pongs.pop_back();
                return Err(err);
            }

            // NB see locking protocol for state.write and state.read
            drop(read);
            drop(write);

            receiver
        };

        // Wait until the PONG operation is received.
        match pong.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::new(
                ErrorKind::TimedOut,
                "flush timed out waiting for PONG",
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::new(ErrorKind::ConnectionReset, "flush failed"))
            }
        }
    }

    /// Closes the client.
    pub(crate) fn close(&self) {
        let mut write = self.state.write.lock();
        let mut read = self.state.read.lock();

        write.flush_kicker.try_send(()).ok();

        // Initiate shutdown process.
        if self.shutdown() {
            // Clear all subscriptions.
            let old_subscriptions = mem::take(&mut read.subscriptions);
            if let Some(writer) = write.writer.as_mut() {
                for sid in old_subscriptions.keys() {
                    let op = ClientOp::Unsub {
                        sid: *sid,
                        max_msgs: None,
                    };
                    proto::encode(&mut *writer, op).ok();
                }
            }

            // Flush the writer in case there are buffered messages, then
            // hang up so the reader thread wakes up.
            if let Some(mut writer) = write.writer.take() {
                writer.flush().ok();
                writer.get_ref().shutdown(Shutdown::Both).ok();
            }

            // Wake up all pending flushes.
            read.pongs.clear();

            // NB see locking protocol for state.write and state.read
            drop(read);
            drop(write);

            join_unless_current(&self.client_thread);
            join_unless_current(&self.flush_thread);
            log::debug!("client closed");
        }
    }

    /// Kicks off the shutdown process, but doesn't wait for its completion.
    /// Returns true if this is the first attempt to shut down the system.
    fn shutdown(&self) -> bool {
        let mut shutdown = self.shutdown.lock();
        let old = *shutdown;
        *shutdown = true;
        !old
    }

    fn check_shutdown(&self) -> io::Result<()> {
        if *self.shutdown.lock() {
            Err(Error::new(ErrorKind::NotConnected, "the client is closed"))
        } else {
            Ok(())
        }
    }

    /// Returns true once the client was closed or lost its connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.check_shutdown().is_err() || self.state.write.lock().writer.is_none()
    }

    /// Subscribes to a subject.
    pub(crate) fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> io::Result<(u64, channel::Receiver<Message>)> {
        let mut write = self.state.write.lock();
        let mut read = self.state.read.lock();

        self.check_shutdown()?;

        // Generate a subject ID.
        let sid = write.next_sid;
        write.next_sid += 1;

        let writer = write.writer.as_mut().ok_or_else(connection_lost)?;
        proto::encode(
            writer,
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            },
        )?;
        write.flush_kicker.try_send(()).ok();

        // Register the subscription in the hash map.
        let (sender, receiver) = channel::unbounded();
        read.subscriptions.insert(
            sid,
            Subscription {
                subject: subject.to_string(),
                messages: sender,
                max_msgs: None,
                delivered: 0,
            },
        );

        // NB see locking protocol for state.write and state.read
        drop(read);
        drop(write);

        log::trace!("subscribed to {} with sid {}", subject, sid);
        Ok((sid, receiver))
    }

    /// Asks the server to drop the subscription after `max_msgs` messages.
    /// The subscription is removed locally once that many were delivered.
    pub(crate) fn auto_unsubscribe(&self, sid: u64, max_msgs: u64) -> io::Result<()> {
        let mut write = self.state.write.lock();
        let mut read = self.state.read.lock();

        self.check_shutdown()?;

        let finished = match read.subscriptions.get_mut(&sid) {
            Some(subscription) => {
                subscription.max_msgs = Some(max_msgs);
                subscription.delivered >= max_msgs
            }
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "subscription not found",
                ))
            }
        };
        if finished {
            read.subscriptions.remove(&sid);
        }

        let writer = write.writer.as_mut().ok_or_else(connection_lost)?;
        proto::encode(
            writer,
            ClientOp::Unsub {
                sid,
                max_msgs: Some(max_msgs),
            },
        )?;
        write.flush_kicker.try_send(()).ok();

        // NB see locking protocol for state.write and state.read
        drop(read);
        drop(write);

        Ok(())
    }

    /// Unsubscribes from a subject.
    pub(crate) fn unsubscribe(&self, sid: u64) -> io::Result<()> {
        let mut write = self.state.write.lock();
        let mut read = self.state.read.lock();

        // Remove the subscription from the map.
        if read.subscriptions.remove(&sid).is_none() {
            // already unsubscribed

            // NB see locking protocol for state.write and state.read
            drop(read);
            drop(write);

            return Ok(());
        }

        // Send an UNSUB message.
        if let Some(writer) = write.writer.as_mut() {
            let max_msgs = None;
            proto::encode(writer, ClientOp::Unsub { sid, max_msgs })?;
            write.flush_kicker.try_send(()).ok();
        }

        // NB see locking protocol for state.write and state.read
        drop(read);
        drop(write);

        log::trace!("unsubscribed sid {}", sid);
        Ok(())
    }

    /// Publishes a message with an optional reply subject.
    pub(crate) fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: &[u8],
    ) -> io::Result<()> {
        self.check_shutdown()?;

        let max_payload = self.server_info.lock().max_payload;
        if max_payload > 0 && payload.len() > max_payload {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "payload size limit of {} exceeded by message size of {}",
                    max_payload,
                    payload.len()
                ),
            ));
        }

        let op = ClientOp::Pub {
            subject,
            reply_to,
            payload,
        };

        let mut write = self.state.write.lock();
        let writer = write.writer.as_mut().ok_or_else(connection_lost)?;

        let res = proto::encode(&mut *writer, op);

        // If writing fails, hang up. The reader thread notices and tears the
        // client down.
        if res.is_err() {
            writer.get_ref().shutdown(Shutdown::Both).ok();
        }

        write.flush_kicker.try_send(()).ok();

        res
    }

    /// Body of the reader thread.
    fn run(&self, reader: BufReader<TcpStream>) {
        let res = self.dispatch(reader);

        if self.check_shutdown().is_ok() {
            match res {
                Ok(()) => log::warn!("connection closed by the server"),
                Err(err) => log::error!("lost connection to the server: {}", err),
            }
        }

        self.disconnect();
        self.options.notify_closed();
    }

    /// Drops the writer and every subscription, which wakes up anyone
    /// blocked on a subscription or a flush.
    fn disconnect(&self) {
        let mut write = self.state.write.lock();
        let mut read = self.state.read.lock();

        if let Some(writer) = write.writer.take() {
            writer.get_ref().shutdown(Shutdown::Both).ok();
        }
        read.subscriptions.clear();
        read.pongs.clear();
        write.flush_kicker.try_send(()).ok();

        // NB see locking protocol for state.write and state.read
        drop(read);
        drop(write);
    }

    /// Body of the flusher thread.
    fn run_flusher(&self, flush_wanted: channel::Receiver<()>) {
        // Track last flush/write time.
        const MIN_FLUSH_BETWEEN: Duration = Duration::from_millis(5);

        let ping_interval = self.options.ping_interval;
        let max_pings_out = self.options.max_pings_out;

        let mut last = Instant::now()
            .checked_sub(MIN_FLUSH_BETWEEN)
            .unwrap_or_else(Instant::now);

        loop {
            if self.is_closed() {
                break;
            }

            match flush_wanted.recv_timeout(ping_interval) {
                Ok(()) => {
                    let since = last.elapsed();
                    if since < MIN_FLUSH_BETWEEN {
                        thread::sleep(MIN_FLUSH_BETWEEN - since);
                    }

                    let mut write = self.state.write.lock();
                    if let Some(writer) = write.writer.as_mut() {
                        let res = writer.flush();
                        last = Instant::now();
                        // If flushing fails, hang up.
                        if let Err(err) = res {
                            log::debug!("flush failed: {}", err);
                            writer.get_ref().shutdown(Shutdown::Both).ok();
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut write = self.state.write.lock();
                    let mut read = self.state.read.lock();

                    if read.pings_out >= max_pings_out {
                        log::warn!("stale connection: {} pings unanswered", read.pings_out);
                        if let Some(writer) = write.writer.as_ref() {
                            writer.get_ref().shutdown(Shutdown::Both).ok();
                        }
                    } else if read.last_active.elapsed() > ping_interval {
                        read.pings_out += 1;
                        read.pongs.push_back(write.flush_kicker.clone());
                        if let Some(writer) = write.writer.as_mut() {
                            proto::encode(&mut *writer, ClientOp::Ping).ok();
                            if writer.flush().is_err() {
                                writer.get_ref().shutdown(Shutdown::Both).ok();
                            }
                        }
                    }

                    // NB see locking protocol for state.write and state.read
                    drop(read);
                    drop(write);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Reads messages from the server and dispatches them to subscribers.
    fn dispatch(&self, mut reader: impl BufRead) -> io::Result<()> {
        // Handle operations received from the server.
        while let Some(op) = proto::decode(&mut reader)? {
            if self.check_shutdown().is_err() {
                return Ok(());
            }

            self.state.read.lock().last_active = Instant::now();

            match op {
                ServerOp::Info(server_info) => {
                    *self.server_info.lock() = server_info;
                }

                ServerOp::Ping => {
                    // Respond with a PONG if connected.
                    let mut write = self.state.write.lock();

                    if let Some(w) = write.writer.as_mut() {
                        proto::encode(w, ClientOp::Pong)?;
                        write.flush_kicker.try_send(()).ok();
                    }
                }

                ServerOp::Pong => {
                    let write = self.state.write.lock();
                    let mut read = self.state.read.lock();

                    // Clear any outstanding pings.
                    read.pings_out = 0;

                    // Take the next expected PONG and complete it by
                    // sending a message.
                    if let Some(pong) = read.pongs.pop_front() {
                        pong.try_send(()).ok();
                    }

                    // NB see locking protocol for state.write and state.read
                    drop(read);
                    drop(write);
                }

                ServerOp::Ok => {}

                ServerOp::Msg {
                    subject,
                    sid,
                    reply_to,
                    payload,
                } => {
                    let mut read = self.state.read.lock();

                    let finished = match read.subscriptions.get_mut(&sid) {
                        Some(subscription) => {
                            let msg = Message {
                                subject,
                                reply: reply_to,
                                data: payload,
                                client: Some(self.clone()),
                            };

                            // The receiving side may already be gone.
                            subscription.messages.send(msg).ok();
                            subscription.delivered += 1;
                            subscription
                                .max_msgs
                                .map_or(false, |max| subscription.delivered >= max)
                        }
                        None => {
                            // Late replies to requests that gave up end here.
                            log::trace!(
                                "dropping message on {} for unknown sid {}",
                                subject,
                                sid
                            );
                            false
                        }
                    };

                    if finished {
                        if let Some(subscription) = read.subscriptions.remove(&sid) {
                            log::trace!(
                                "subscription {} on {} reached its limit",
                                sid,
                                subscription.subject
                            );
                        }
                    }
                }

                ServerOp::Err(msg) => {
                    let client_id = self.server_info.lock().client_id;
                    self.options
                        .report_error(client_id, Error::new(ErrorKind::Other, msg));
                }

                ServerOp::Unknown(line) => {
                    log::warn!("unknown op: {}", line);
                }
            }
        }

        // The stream of operations ended.
        if self.check_shutdown().is_err() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::ConnectionReset,
                "connection closed by the server",
            ))
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Client").finish()
    }
}

fn connection_lost() -> Error {
    Error::new(
        ErrorKind::NotConnected,
        "the connection to the server was lost",
    )
}

fn join_unless_current(handle: &Mutex<Option<JoinHandle<()>>>) {
    let handle = handle.lock().take();
    if let Some(handle) = handle {
        if handle.thread().id() != thread::current().id() {
            handle.join().ok();
        }
    }
}
