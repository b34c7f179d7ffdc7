use std::{
    collections::HashMap,
    fmt::Display,
    io::{self, BufRead, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

use rand::seq::SliceRandom;
use serde::Deserialize;

fn default_echo() -> bool {
    true
}

/// The parts of a CONNECT message the server cares about.
#[derive(Clone, Deserialize, Debug)]
struct ConnectInfo {
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_echo")]
    echo: bool,
    lang: String,
    version: String,
}

struct Subscription {
    subject: String,
    queue: Option<String>,
    delivered: u64,
    max: Option<u64>,
}

struct Client {
    socket: TcpStream,
    echo: bool,
    subs: HashMap<u64, Subscription>,
}

#[derive(Default)]
struct State {
    clients: HashMap<usize, Client>,
}

type Shared = Arc<Mutex<State>>;

fn lock(state: &Shared) -> MutexGuard<'_, State> {
    // Ignore poisoning left by a panicked client thread.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An in-process NATS server for tests. It is stopped on drop, which also
/// hangs up on every connected client.
pub struct NatsTestServer {
    address: SocketAddr,
    shutdown: Arc<AtomicBool>,
    state: Shared,
    handle: Option<JoinHandle<()>>,
}

pub struct NatsTestServerBuilder<A> {
    baddr: A,
    max_payload: usize,
}

impl NatsTestServer {
    pub fn build() -> NatsTestServerBuilder<&'static str> {
        NatsTestServerBuilder {
            baddr: "127.0.0.1:0",
            max_payload: 1024 * 1024,
        }
    }

    /// Get the socket address on which the test server is listening
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The address as a `nats://` URL.
    pub fn url(&self) -> String {
        format!("nats://{}", self.address)
    }

    /// Number of clients currently connected.
    pub fn client_count(&self) -> usize {
        lock(&self.state).clients.len()
    }

    /// Hangs up on every connected client while staying up.
    pub fn evict_all(&self) {
        let mut state = lock(&self.state);
        for (client_id, client) in state.clients.drain() {
            log::debug!("{}: evicted", client_id);
            client.socket.shutdown(Shutdown::Both).ok();
        }
    }
}

impl Drop for NatsTestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.evict_all();
        if let Some(handle) = self.handle.take() {
            if let Err(_err) = handle.join() {
                log::warn!("Error joining TestNats server thread for shutdown");
            }
            log::debug!("Stopped server");
        }
    }
}

impl<A: ToSocketAddrs + Display + Send + 'static> NatsTestServerBuilder<A> {
    ///  Address for server to listen for NATS connections
    pub fn address<B>(self, baddr: B) -> NatsTestServerBuilder<B> {
        NatsTestServerBuilder {
            baddr,
            max_payload: self.max_payload,
        }
    }

    /// Largest payload announced in INFO and accepted in PUB.
    pub fn max_payload(self, max_payload: usize) -> Self {
        Self {
            max_payload,
            ..self
        }
    }

    /// Spawn the server on a thread, returns controller struct which will stop
    /// the server on drop
    pub fn spawn(self) -> NatsTestServer {
        let listener = TcpListener::bind(&self.baddr).unwrap();
        let listen_addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        log::info!(
            "nats test server started on {} (requested {})",
            listen_addr,
            &self.baddr,
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Shared::default();
        let max_payload = self.max_payload;
        let handle = Some({
            let shutdown = shutdown.clone();
            let state = state.clone();
            thread::spawn(move || accept_loop(listener, shutdown, state, max_payload))
        });

        NatsTestServer {
            address: listen_addr,
            shutdown,
            state,
            handle,
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    state: Shared,
    max_payload: usize,
) {
    let addr = listener.local_addr().unwrap();
    let mut max_client_id = 0;

    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        let mut socket = match listener.accept() {
            Ok((socket, _addr)) => socket,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(err) => {
                log::warn!("accept failed: {}", err);
                continue;
            }
        };

        max_client_id += 1;
        let client_id = max_client_id;
        log::debug!("{}: connected", client_id);

        let info = format!(
            "INFO {{\"server_id\":\"test\",\"server_name\":\"test\",\"host\":\"{}\",\
             \"port\":{},\"version\":\"2.10.0\",\"go\":\"go1.21\",\"max_payload\":{},\
             \"proto\":1,\"headers\":false,\"client_id\":{}}}\r\n",
            addr.ip(),
            addr.port(),
            max_payload,
            client_id
        );
        let writer = socket.set_nonblocking(false).and_then(|()| {
            socket.write_all(info.as_bytes())?;
            socket.try_clone()
        });
        let writer = match writer {
            Ok(writer) => writer,
            Err(err) => {
                log::debug!("{}: handshake failed: {}", client_id, err);
                continue;
            }
        };

        lock(&state).clients.insert(
            client_id,
            Client {
                socket: writer,
                echo: true,
                subs: HashMap::new(),
            },
        );

        let state = state.clone();
        thread::spawn(move || {
            let res = serve(client_id, socket, &state, max_payload);
            if let Err(err) = res {
                log::debug!("{}: {}", client_id, err);
            }
            if let Some(client) = lock(&state).clients.remove(&client_id) {
                client.socket.shutdown(Shutdown::Both).ok();
            }
            log::debug!("{}: disconnected", client_id);
        });
    }
}

#[derive(Debug)]
enum ClientAction {
    None,
    Reply(&'static str),
    Error(String),
    Publish {
        subject: String,
        reply: Option<String>,
        payload: Vec<u8>,
    },
}

fn serve(client_id: usize, socket: TcpStream, state: &Shared, max_payload: usize) -> io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    let mut verbose = false;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        if command.is_empty() {
            continue;
        }
        log::trace!("{}: got command {}", client_id, command);

        let action = handle_command(client_id, command, &mut reader, state, max_payload, &mut verbose)?;
        log::trace!("{}: causes action {:?}", client_id, &action);

        match action {
            ClientAction::None => {}
            ClientAction::Reply(reply) => write_to(state, client_id, reply.as_bytes()),
            ClientAction::Error(err) => {
                write_to(state, client_id, format!("-ERR '{}'\r\n", err).as_bytes());
            }
            ClientAction::Publish {
                subject,
                reply,
                payload,
            } => {
                if verbose {
                    write_to(state, client_id, b"+OK\r\n");
                }
                publish(client_id, state, &subject, reply.as_deref(), &payload);
            }
        }
    }
}

fn handle_command(
    client_id: usize,
    command: &str,
    reader: &mut impl BufRead,
    state: &Shared,
    max_payload: usize,
    verbose: &mut bool,
) -> io::Result<ClientAction> {
    let (op, args) = command.split_once(' ').unwrap_or((command, ""));
    let parts: Vec<&str> = args.split_whitespace().collect();

    let action = match op.to_ascii_uppercase().as_str() {
        "PING" => ClientAction::Reply("PONG\r\n"),
        "PONG" => ClientAction::None,
        "CONNECT" => match serde_json::from_str::<ConnectInfo>(args) {
            Ok(info) => {
                log::debug!(
                    "{}: {} client {} named {:?}",
                    client_id,
                    info.lang,
                    info.version,
                    info.name
                );
                *verbose = info.verbose;
                if let Some(client) = lock(state).clients.get_mut(&client_id) {
                    client.echo = info.echo;
                }
                ClientAction::None
            }
            Err(err) => ClientAction::Error(format!("invalid CONNECT: {}", err)),
        },
        "SUB" => {
            let (subject, queue, sid) = match parts[..] {
                [subject, sid] => (subject, None, sid),
                [subject, queue, sid] => (subject, Some(queue), sid),
                _ => return Ok(ClientAction::Error("Unknown Protocol Operation".into())),
            };
            let sid = match sid.parse::<u64>() {
                Ok(sid) => sid,
                Err(_) => return Ok(ClientAction::Error("Invalid sid".into())),
            };
            if let Some(client) = lock(state).clients.get_mut(&client_id) {
                client.subs.insert(
                    sid,
                    Subscription {
                        subject: subject.to_string(),
                        queue: queue.map(String::from),
                        delivered: 0,
                        max: None,
                    },
                );
            }
            ClientAction::None
        }
        "UNSUB" => {
            let (sid, max) = match parts[..] {
                [sid] => (sid.parse::<u64>().ok(), None),
                [sid, max] => (sid.parse::<u64>().ok(), max.parse::<u64>().ok()),
                _ => (None, None),
            };
            let sid = match sid {
                Some(sid) => sid,
                None => return Ok(ClientAction::Error("Unknown Protocol Operation".into())),
            };
            if let Some(client) = lock(state).clients.get_mut(&client_id) {
                let finished = match (client.subs.get_mut(&sid), max) {
                    (Some(sub), Some(max)) => {
                        sub.max = Some(max);
                        sub.delivered >= max
                    }
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if finished {
                    client.subs.remove(&sid);
                }
            }
            ClientAction::None
        }
        "PUB" => {
            let (subject, reply, len) = match parts[..] {
                [subject, len] => (subject, None, len),
                [subject, reply, len] => (subject, Some(reply), len),
                _ => return Ok(ClientAction::Error("Unknown Protocol Operation".into())),
            };
            let len = match len.parse::<usize>() {
                Ok(len) => len,
                Err(_) => return Ok(ClientAction::Error("Invalid payload size".into())),
            };

            let mut payload = vec![0; len + 2];
            reader.read_exact(&mut payload)?;
            if !payload.ends_with(b"\r\n") {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "payload not terminated by CRLF",
                ));
            }
            payload.truncate(len);

            if len > max_payload {
                return Ok(ClientAction::Error("Maximum Payload Violation".into()));
            }

            ClientAction::Publish {
                subject: subject.to_owned(),
                reply: reply.map(|r| r.to_owned()),
                payload,
            }
        }
        _ => ClientAction::Error("Unknown Protocol Operation".into()),
    };

    Ok(action)
}

fn write_to(state: &Shared, client_id: usize, bytes: &[u8]) {
    if let Some(client) = lock(state).clients.get_mut(&client_id) {
        if let Err(err) = client.socket.write_all(bytes) {
            log::debug!("{}: write failed: {}", client_id, err);
        }
    }
}

/// Routes a message to every matching plain subscription and to one member
/// of every matching queue group.
fn publish(from: usize, state: &Shared, subject: &str, reply: Option<&str>, payload: &[u8]) {
    let mut state = lock(state);

    let mut targets: Vec<(usize, u64)> = Vec::new();
    let mut groups: HashMap<&str, Vec<(usize, u64)>> = HashMap::new();
    for (client_id, client) in &state.clients {
        if *client_id == from && !client.echo {
            continue;
        }
        for (sid, sub) in &client.subs {
            if !subject_match(subject, &sub.subject) {
                continue;
            }
            match &sub.queue {
                Some(queue) => groups.entry(queue.as_str()).or_default().push((*client_id, *sid)),
                None => targets.push((*client_id, *sid)),
            }
        }
    }
    let mut rng = rand::thread_rng();
    for members in groups.values() {
        if let Some(member) = members.choose(&mut rng) {
            targets.push(*member);
        }
    }

    for (client_id, sid) in targets {
        let client = match state.clients.get_mut(&client_id) {
            Some(client) => client,
            None => continue,
        };

        let mut out = match reply {
            Some(reply) => format!("MSG {} {} {} {}\r\n", subject, sid, reply, payload.len()),
            None => format!("MSG {} {} {}\r\n", subject, sid, payload.len()),
        }
        .into_bytes();
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\n");
        log::trace!("{}: sending msg on {} to sid {}", client_id, subject, sid);

        if let Err(err) = client.socket.write_all(&out) {
            log::debug!("{}: write failed: {}", client_id, err);
            continue;
        }

        let finished = match client.subs.get_mut(&sid) {
            Some(sub) => {
                sub.delivered += 1;
                sub.max.map_or(false, |max| sub.delivered >= max)
            }
            None => false,
        };
        if finished {
            client.subs.remove(&sid);
        }
    }
}

/// Does the subject match the pattern
fn subject_match(subject: &str, subject_pattern: &str) -> bool {
    let mut pattern_parts = subject_pattern.split('.');
    for subject_part in subject.split('.') {
        if let Some(pattern_part) = pattern_parts.next() {
            if pattern_part == ">" {
                return true;
            } else if pattern_part == subject_part || pattern_part == "*" {
                continue;
            }
        }
        return false;
    }
    pattern_parts.next().is_none()
}
