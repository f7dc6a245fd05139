//! Redis-protocol (RESP2) cache client pooled with `r2d2`.
//!
//! Only the handful of commands the cache tier needs are spoken here:
//! `GET`, `SET … EX`, `DEL`, `SCAN … MATCH` and `PING`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::KeyValueStore;
use crate::error::{CoreError, Result};

#[derive(Debug, Error)]
pub enum RespError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(String),
}

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn read_line<R: BufRead>(reader: &mut R) -> std::result::Result<String, RespError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(RespError::Protocol("connection closed".into()));
    }
    if !line.ends_with("\r\n") {
        return Err(RespError::Protocol(format!("unterminated line: {line:?}")));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_len(s: &str) -> std::result::Result<i64, RespError> {
    s.parse::<i64>()
        .map_err(|_| RespError::Protocol(format!("bad length: {s}")))
}

/// Read one reply from `reader`.
pub fn read_reply<R: BufRead>(reader: &mut R) -> std::result::Result<Reply, RespError> {
    let line = read_line(reader)?;
    // Every tag is a single ASCII byte, so `rest` starts on a char boundary.
    let tag = line.as_bytes().first().copied().filter(u8::is_ascii);
    let rest = if tag.is_some() { &line[1..] } else { "" };
    match tag {
        Some(b'+') => Ok(Reply::Simple(rest.to_string())),
        Some(b'-') => Ok(Reply::Error(rest.to_string())),
        Some(b':') => Ok(Reply::Int(parse_len(rest)?)),
        Some(b'$') => {
            let len = parse_len(rest)?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut buf = vec![0u8; len as usize + 2];
            reader.read_exact(&mut buf)?;
            buf.truncate(len as usize);
            Ok(Reply::Bulk(Some(buf)))
        }
        Some(b'*') => {
            let len = parse_len(rest)?;
            if len < 0 {
                return Ok(Reply::Array(None));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_reply(reader)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        _ => Err(RespError::Protocol(format!("unknown reply type: {line:?}"))),
    }
}

/// Escape glob metacharacters so a prefix can be used in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

pub struct RespConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Set once an I/O or framing error leaves the stream in an unknown state.
    broken: bool,
}

impl RespConnection {
    pub fn connect(addr: &str, timeout: Duration) -> std::result::Result<Self, RespError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            broken: false,
        })
    }

    pub fn call(&mut self, args: &[&[u8]]) -> std::result::Result<Reply, RespError> {
        let reply = self
            .writer
            .write_all(&encode_command(args))
            .map_err(RespError::from)
            .and_then(|()| read_reply(&mut self.reader));
        match reply {
            Ok(Reply::Error(msg)) => Err(RespError::Server(msg)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A partial write or read leaves unread bytes on the wire.
                debug!(error = %e, "resp connection marked broken");
                self.broken = true;
                Err(e)
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

/// `r2d2` manager for RESP connections.
pub struct RespConnectionManager {
    addr: String,
    io_timeout: Duration,
}

impl r2d2::ManageConnection for RespConnectionManager {
    type Connection = RespConnection;
    type Error = RespError;

    fn connect(&self) -> std::result::Result<RespConnection, RespError> {
        RespConnection::connect(&self.addr, self.io_timeout)
    }

    fn is_valid(&self, conn: &mut RespConnection) -> std::result::Result<(), RespError> {
        match conn.call(&[b"PING"])? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(RespError::Protocol(format!("unexpected PING reply: {other:?}"))),
        }
    }

    fn has_broken(&self, conn: &mut RespConnection) -> bool {
        conn.is_broken()
    }
}

/// Cache tier backed by a Redis-compatible server.
pub struct RedisKv {
    pool: r2d2::Pool<RespConnectionManager>,
}

impl RedisKv {
    /// Build the pool without dialing: a cache that is down at startup must not
    /// prevent the service from starting.
    pub fn new(host: &str, port: u16, pool_size: u32, io_timeout: Duration) -> Self {
        let io_timeout = io_timeout.max(Duration::from_millis(1));
        let manager = RespConnectionManager {
            addr: format!("{host}:{port}"),
            io_timeout,
        };
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(io_timeout)
            .build_unchecked(manager);
        Self { pool }
    }

    fn call(&self, args: &[&[u8]]) -> Result<Reply> {
        let mut conn = self.pool.get().map_err(CoreError::kv)?;
        conn.call(args).map_err(CoreError::kv)
    }
}

impl KeyValueStore for RedisKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.call(&[b"GET", key.as_bytes()])? {
            Reply::Bulk(None) => Ok(None),
            Reply::Bulk(Some(bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(CoreError::kv),
            other => Err(CoreError::kv(format!("unexpected GET reply: {other:?}"))),
        }
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1).to_string();
        self.call(&[b"SET", key.as_bytes(), value.as_bytes(), b"EX", secs.as_bytes()])?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.call(&[b"DEL", key.as_bytes()])?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let pattern = glob_escape(prefix);
        let mut cursor = "0".to_string();
        let mut removed = 0usize;
        loop {
            let reply = self.call(&[
                b"SCAN",
                cursor.as_bytes(),
                b"MATCH",
                pattern.as_bytes(),
                b"COUNT",
                b"100",
            ])?;
            let (next, keys) = match reply {
                Reply::Array(Some(mut parts)) if parts.len() == 2 => {
                    let keys = parts.pop();
                    let next = parts.pop();
                    match (next, keys) {
                        (Some(Reply::Bulk(Some(c))), Some(Reply::Array(Some(keys)))) => (c, keys),
                        _ => return Err(CoreError::kv("malformed SCAN reply")),
                    }
                }
                other => return Err(CoreError::kv(format!("unexpected SCAN reply: {other:?}"))),
            };

            let keys: Vec<Vec<u8>> = keys
                .into_iter()
                .filter_map(|k| match k {
                    Reply::Bulk(Some(k)) => Some(k),
                    _ => None,
                })
                .collect();
            if !keys.is_empty() {
                let mut args: Vec<&[u8]> = vec![b"DEL".as_slice()];
                args.extend(keys.iter().map(|k| k.as_slice()));
                if let Reply::Int(n) = self.call(&args)? {
                    removed += n.max(0) as usize;
                }
            }

            cursor = String::from_utf8_lossy(&next).into_owned();
            if cursor == "0" {
                break;
            }
        }
        debug!(%prefix, removed, "deleted cache keys by prefix");
        Ok(removed)
    }

    fn ping(&self) -> Result<()> {
        match self.call(&[b"PING"])? {
            Reply::Simple(s) if s == "PONG" => Ok(()),
            other => Err(CoreError::kv(format!("unexpected PING reply: {other:?}"))),
        }
    }
}
