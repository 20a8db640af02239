//! In-process memcached stand-ins for integration tests.
//!
//! `MockServer` speaks the text protocol over tokio on a private runtime
//! thread. The scripted helpers use plain `std::net` for failure scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener as StdListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Largest payload the mock accepts, matching memcached's default item size.
pub const ITEM_SIZE_MAX: usize = 1024 * 1024;

struct Item {
    flags: u32,
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Item {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct State {
    items: Mutex<HashMap<String, Item>>,
    connections: AtomicUsize,
    started: Instant,
}

/// Memcached text-protocol server bound to an ephemeral local port.
pub struct MockServer {
    addr: String,
    state: Arc<State>,
}

impl MockServer {
    pub fn start() -> Self {
        let state = Arc::new(State {
            items: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            started: Instant::now(),
        });
        let (tx, rx) = mpsc::channel();
        let server_state = Arc::clone(&state);

        thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("mock runtime");
            runtime.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
                tx.send(listener.local_addr().expect("addr")).expect("report addr");
                while let Ok((stream, _)) = listener.accept().await {
                    server_state.connections.fetch_add(1, Ordering::SeqCst);
                    let state = Arc::clone(&server_state);
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, state).await;
                    });
                }
            });
        });

        let addr = rx.recv().expect("mock server address").to_string();
        MockServer { addr, state }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Looks up a stored item by its on-server key, bypassing the client.
    pub fn item(&self, key: &str) -> Option<(u32, Vec<u8>)> {
        let items = self.state.items.lock().expect("items lock");
        items
            .get(key)
            .filter(|item| !item.is_expired(Instant::now()))
            .map(|item| (item.flags, item.data.clone()))
    }

    pub fn len(&self) -> usize {
        self.state.items.lock().expect("items lock").len()
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = Vec::with_capacity(1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        while let Some(command) = next_command(&mut buffer) {
            execute(&command, &state, &mut out);
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }

    Ok(())
}

struct Command {
    words: Vec<String>,
    data: Option<Vec<u8>>,
    bad_chunk: bool,
}

fn is_storage(verb: &str) -> bool {
    matches!(verb, "set" | "add" | "replace" | "append" | "prepend")
}

/// Splits one complete command off the front of `buffer`.
fn next_command(buffer: &mut BytesMut) -> Option<Command> {
    let line_end = buffer.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&buffer[..line_end]).into_owned();
    let words: Vec<String> = line.split_whitespace().map(str::to_owned).collect();

    let data_len = match words.first() {
        Some(verb) if is_storage(verb) => words.get(4).and_then(|w| w.parse::<usize>().ok()),
        _ => None,
    };
    let Some(len) = data_len else {
        buffer.advance(line_end + 2);
        return Some(Command {
            words,
            data: None,
            bad_chunk: false,
        });
    };

    if buffer.len() < line_end + 2 + len + 2 {
        return None;
    }
    buffer.advance(line_end + 2);
    let block = buffer.split_to(len + 2);
    Some(Command {
        words,
        data: Some(block[..len].to_vec()),
        bad_chunk: &block[len..] != b"\r\n",
    })
}

fn push_line(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn execute(command: &Command, state: &State, out: &mut Vec<u8>) {
    let Some(verb) = command.words.first() else {
        push_line(out, "ERROR");
        return;
    };
    let args = &command.words[1..];
    let mut items = state.items.lock().expect("items lock");
    let now = Instant::now();
    items.retain(|_, item| !item.is_expired(now));

    match verb.as_str() {
        "get" | "gets" => {
            for key in args {
                if let Some(item) = items.get(key) {
                    push_line(out, &format!("VALUE {key} {} {}", item.flags, item.data.len()));
                    out.extend_from_slice(&item.data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            push_line(out, "END");
        }
        verb if is_storage(verb) => {
            let noreply = args.get(4).is_some_and(|w| w == "noreply");
            let reply = store(verb, args, command, &mut items, now);
            if !noreply {
                push_line(out, reply);
            }
        }
        "delete" => {
            let noreply = args.get(1).is_some_and(|w| w == "noreply");
            let reply = match args.first() {
                Some(key) if items.remove(key).is_some() => "DELETED",
                Some(_) => "NOT_FOUND",
                None => "ERROR",
            };
            if !noreply {
                push_line(out, reply);
            }
        }
        "incr" | "decr" => {
            let reply = arith(verb == "incr", args, &mut items);
            push_line(out, &reply);
        }
        "stats" => {
            let uptime = state.started.elapsed().as_secs();
            push_line(out, &format!("STAT pid {}", std::process::id()));
            push_line(out, &format!("STAT uptime {uptime}"));
            push_line(out, "STAT version 1.6.21");
            push_line(out, "STAT rusage_user 0.012000");
            push_line(
                out,
                &format!("STAT total_connections {}", state.connections.load(Ordering::SeqCst)),
            );
            push_line(out, &format!("STAT curr_items {}", items.len()));
            push_line(out, "END");
        }
        _ => push_line(out, "ERROR"),
    }
}

fn store(
    verb: &str,
    args: &[String],
    command: &Command,
    items: &mut HashMap<String, Item>,
    now: Instant,
) -> &'static str {
    let (Some(key), Some(flags), Some(exptime), Some(data)) = (
        args.first(),
        args.get(1).and_then(|w| w.parse::<u32>().ok()),
        args.get(2).and_then(|w| w.parse::<i64>().ok()),
        command.data.as_ref(),
    ) else {
        return "CLIENT_ERROR bad command line format";
    };
    if command.bad_chunk {
        return "CLIENT_ERROR bad data chunk";
    }
    if data.len() > ITEM_SIZE_MAX {
        return "SERVER_ERROR object too large for cache";
    }

    let expires_at = match exptime {
        0 => None,
        secs if secs < 0 => Some(now),
        secs => Some(now + Duration::from_secs(secs as u64)),
    };
    let exists = items.contains_key(key);
    let fresh = Item {
        flags,
        data: data.clone(),
        expires_at,
    };

    match verb {
        "set" => {
            items.insert(key.clone(), fresh);
        }
        "add" if exists => return "NOT_STORED",
        "add" => {
            items.insert(key.clone(), fresh);
        }
        "replace" if !exists => return "NOT_STORED",
        "replace" => {
            items.insert(key.clone(), fresh);
        }
        _ => {
            let Some(item) = items.get_mut(key) else {
                return "NOT_STORED";
            };
            if verb == "append" {
                item.data.extend_from_slice(data);
            } else {
                let mut joined = data.clone();
                joined.extend_from_slice(&item.data);
                item.data = joined;
            }
        }
    }
    "STORED"
}

fn arith(increment: bool, args: &[String], items: &mut HashMap<String, Item>) -> String {
    let (Some(key), Some(delta)) = (args.first(), args.get(1)) else {
        return "ERROR".to_string();
    };
    let Ok(delta) = delta.parse::<u64>() else {
        return "CLIENT_ERROR invalid numeric delta argument".to_string();
    };
    let Some(item) = items.get_mut(key) else {
        return "NOT_FOUND".to_string();
    };
    let current = std::str::from_utf8(&item.data)
        .ok()
        .and_then(|text| text.trim_end().parse::<u64>().ok());
    let Some(current) = current else {
        return "CLIENT_ERROR cannot increment or decrement non-numeric value".to_string();
    };

    let next = if increment {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    item.data = next.to_string().into_bytes();
    next.to_string()
}

/// Accepts connections and answers every read with `reply`, once per read.
pub fn spawn_scripted(reply: &'static [u8]) -> String {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 || stream.write_all(reply).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Accepts connections and never answers.
pub fn spawn_silent() -> String {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => held.push(stream),
                Err(_) => break,
            }
        }
    });
    addr
}

/// Returns an address nothing listens on.
pub fn dead_addr() -> String {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").to_string()
}
