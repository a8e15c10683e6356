//! Redis connection and command primitive.
//!
//! A thin RESP client over a buffered TCP stream, with explicit
//! `send`/`flush`/`receive` so callers can pipeline a batch of commands and
//! round-trip once. Every read and write carries the client's deadline.

use crate::error::{CacheMgrError, Result};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// `set_master` target meaning "become master" (SLAVEOF NO ONE).
pub const NO_ONE: &str = "NO:ONE";

/// One parsed RESP reply. Error replies are surfaced as `Err`, not as a
/// variant, matching how callers treat them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Int(i64),
    Data(Vec<u8>),
    Array(Vec<RespValue>),
    Nil,
}

impl RespValue {
    /// Text content of a simple or bulk string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::Simple(s) => Some(s.clone()),
            RespValue::Data(d) => Some(String::from_utf8_lossy(d).into_owned()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Interpret an array of alternating keys and values as a string map,
    /// the shape `SENTINEL masters` entries come in.
    pub fn as_string_map(&self) -> Option<HashMap<String, String>> {
        let items = self.as_array()?;
        let mut map = HashMap::with_capacity(items.len() / 2);
        for pair in items.chunks(2) {
            match pair {
                [k, v] => {
                    map.insert(k.as_text()?, v.as_text()?);
                }
                _ => return None,
            }
        }
        Some(map)
    }
}

pub struct RedisClient {
    stream: BufStream<TcpStream>,
    addr: String,
    timeout: Duration,
    last_use: Instant,
    broken: bool,
}

impl RedisClient {
    /// Connect and authenticate when `auth` is non-empty.
    pub async fn connect(addr: &str, auth: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CacheMgrError::Timeout(format!("connect {}", addr)))?
            .map_err(|e| CacheMgrError::Network(format!("connect {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CacheMgrError::Network(format!("connect {}: {}", addr, e)))?;

        let mut client = Self {
            stream: BufStream::new(stream),
            addr: addr.to_string(),
            timeout,
            last_use: Instant::now(),
            broken: false,
        };
        if !auth.is_empty() {
            client.command(&["AUTH", auth]).await?;
        }
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// A client that errored must not go back into a pool.
    pub fn is_recyclable(&self) -> bool {
        !self.broken
    }

    fn mark_broken<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Queue one command without flushing; pair with [`Self::flush`] and
    /// [`Self::receive`] for pipelining.
    pub async fn send(&mut self, args: &[&str]) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        let deadline = self.timeout;
        let result = tokio::time::timeout(deadline, self.stream.write_all(&buf))
            .await
            .map_err(|_| CacheMgrError::Timeout(format!("send to {}", self.addr)))
            .and_then(|r| r.map_err(|e| CacheMgrError::Network(format!("send: {}", e))));
        self.mark_broken(result)
    }

    pub async fn flush(&mut self) -> Result<()> {
        let deadline = self.timeout;
        let result = tokio::time::timeout(deadline, self.stream.flush())
            .await
            .map_err(|_| CacheMgrError::Timeout(format!("flush to {}", self.addr)))
            .and_then(|r| r.map_err(|e| CacheMgrError::Network(format!("flush: {}", e))));
        self.mark_broken(result)
    }

    /// Read one reply. An error reply (`-ERR ...`) is returned as `Err` and
    /// does not mark the connection broken; protocol and transport errors
    /// do.
    pub async fn receive(&mut self) -> Result<RespValue> {
        let deadline = self.timeout;
        self.last_use = Instant::now();
        match tokio::time::timeout(deadline, read_reply(&mut self.stream)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ CacheMgrError::RedisProtocol(_))) => {
                // Command-level error; the connection itself is fine only
                // for simple replies, but pipelined state is unknown.
                Err(e)
            }
            Ok(Err(e)) => {
                self.broken = true;
                Err(e)
            }
            Err(_) => {
                self.broken = true;
                Err(CacheMgrError::Timeout(format!("receive from {}", self.addr)))
            }
        }
    }

    /// Send one command and read its reply.
    pub async fn command(&mut self, args: &[&str]) -> Result<RespValue> {
        self.send(args).await?;
        self.flush().await?;
        self.receive().await
    }

    /// `INFO`, parsed into a key/value map.
    pub async fn info(&mut self) -> Result<HashMap<String, String>> {
        let reply = self.command(&["INFO"]).await?;
        let text = reply
            .as_text()
            .ok_or_else(|| CacheMgrError::RedisProtocol("INFO reply is not a string".into()))?;
        Ok(parse_info(&text))
    }

    /// `INFO` plus `INFO keyspace`, merged. Returns the raw combined text
    /// alongside the parsed map for pass-through endpoints.
    pub async fn info_full(&mut self) -> Result<(String, HashMap<String, String>)> {
        let base = self
            .command(&["INFO"])
            .await?
            .as_text()
            .ok_or_else(|| CacheMgrError::RedisProtocol("INFO reply is not a string".into()))?;
        let keyspace = self
            .command(&["INFO", "keyspace"])
            .await?
            .as_text()
            .unwrap_or_default();
        let text = format!("{}\r\n{}", base.trim_end(), keyspace);
        let map = parse_info(&text);
        Ok((text, map))
    }

    /// Ask the server to refresh keyspace statistics before the next
    /// `INFO keyspace`.
    pub async fn enable_keyspace(&mut self) -> Result<()> {
        self.command(&["INFO", "keyspace", "1"]).await?;
        Ok(())
    }

    /// Reconfigure replication. `NO:ONE` promotes the server to master.
    pub async fn set_master(&mut self, master: &str) -> Result<()> {
        if master == NO_ONE {
            self.command(&["SLAVEOF", "NO", "ONE"]).await?;
        } else {
            let (host, port) = split_addr(master)?;
            self.command(&["SLAVEOF", &host, &port]).await?;
        }
        Ok(())
    }

    /// Re-point at `master` and force a full resync instead of a partial
    /// one.
    pub async fn force_full_sync_from_master(&mut self, master: &str) -> Result<()> {
        let (host, port) = split_addr(master)?;
        self.command(&["SLAVEOF", &host, &port, "FORCE"]).await?;
        Ok(())
    }
}

fn split_addr(addr: &str) -> Result<(String, String)> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.is_empty() => {
            Ok((host.to_string(), port.to_string()))
        }
        _ => Err(CacheMgrError::InvalidArgument(format!(
            "invalid address '{}'",
            addr
        ))),
    }
}

async fn read_line(stream: &mut BufStream<TcpStream>) -> Result<String> {
    let mut line = String::new();
    let n = stream
        .read_line(&mut line)
        .await
        .map_err(|e| CacheMgrError::Network(format!("read: {}", e)))?;
    if n == 0 {
        return Err(CacheMgrError::Network("connection closed".into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn read_reply<'a>(
    stream: &'a mut BufStream<TcpStream>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RespValue>> + Send + 'a>> {
    // Boxed for the recursive array case.
    Box::pin(async move {
        let line = read_line(stream).await?;
        if line.is_empty() {
            return Err(CacheMgrError::RedisProtocol("empty reply line".into()));
        }
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Ok(RespValue::Simple(rest.to_string())),
            "-" => Err(CacheMgrError::RedisProtocol(rest.to_string())),
            ":" => rest
                .parse()
                .map(RespValue::Int)
                .map_err(|_| CacheMgrError::RedisProtocol(format!("bad integer '{}'", rest))),
            "$" => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| CacheMgrError::RedisProtocol(format!("bad length '{}'", rest)))?;
                if len < 0 {
                    return Ok(RespValue::Nil);
                }
                let mut data = vec![0u8; len as usize + 2];
                stream
                    .read_exact(&mut data)
                    .await
                    .map_err(|e| CacheMgrError::Network(format!("read: {}", e)))?;
                data.truncate(len as usize);
                Ok(RespValue::Data(data))
            }
            "*" => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| CacheMgrError::RedisProtocol(format!("bad length '{}'", rest)))?;
                if len < 0 {
                    return Ok(RespValue::Nil);
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_reply(stream).await?);
                }
                Ok(RespValue::Array(items))
            }
            _ => Err(CacheMgrError::RedisProtocol(format!(
                "unexpected reply line '{}'",
                line
            ))),
        }
    })
}

/// Parse `INFO` output (`key:value` lines, `#` section headers) into a map.
pub fn parse_info(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// How long an idle pooled connection stays usable.
const POOL_IDLE_MAX: Duration = Duration::from_secs(30);
/// Idle connections kept per endpoint.
const POOL_PER_ENDPOINT: usize = 4;

/// Connection pool keyed by endpoint address. Clients are checked out,
/// used, and returned; broken clients are dropped on return.
pub struct RedisPool {
    auth: String,
    timeout: Duration,
    idle: parking_lot::Mutex<HashMap<String, VecDeque<RedisClient>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl RedisPool {
    pub fn new(auth: &str, timeout: Duration) -> Self {
        Self {
            auth: auth.to_string(),
            timeout,
            idle: parking_lot::Mutex::new(HashMap::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn get_client(&self, addr: &str) -> Result<RedisClient> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CacheMgrError::ClosedTopom);
        }
        loop {
            let candidate = self.idle.lock().get_mut(addr).and_then(|q| q.pop_front());
            match candidate {
                Some(client) if client.last_use.elapsed() < POOL_IDLE_MAX => return Ok(client),
                Some(_) => continue,
                None => break,
            }
        }
        RedisClient::connect(addr, &self.auth, self.timeout).await
    }

    pub fn put_client(&self, client: RedisClient) {
        if !client.is_recyclable() || self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let mut idle = self.idle.lock();
        let queue = idle.entry(client.addr.clone()).or_default();
        if queue.len() < POOL_PER_ENDPOINT {
            queue.push_back(client);
        }
    }

    /// `INFO` + `INFO keyspace` through a pooled connection.
    pub async fn info_full(&self, addr: &str) -> Result<(String, HashMap<String, String>)> {
        let mut client = self.get_client(addr).await?;
        let result = client.info_full().await;
        self.put_client(client);
        result
    }

    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.idle.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    /// Serve one connection with a canned byte script.
    async fn one_shot_server(replies: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = vec![0u8; 4096];
            // Drain whatever the client sends, then reply.
            let _ = socket.read(&mut sink).await;
            socket.write_all(replies).await.unwrap();
            socket.flush().await.unwrap();
            // Hold the socket open long enough for the client to read.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let addr = one_shot_server(b"+PONG\r\n").await;
        let mut client = RedisClient::connect(&addr, "", Duration::from_secs(1))
            .await
            .unwrap();
        let reply = client.command(&["PING"]).await.unwrap();
        assert_eq!(reply, RespValue::Simple("PONG".into()));
        assert!(client.is_recyclable());
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_error() {
        let addr = one_shot_server(b"-ERR unknown command\r\n").await;
        let mut client = RedisClient::connect(&addr, "", Duration::from_secs(1))
            .await
            .unwrap();
        let err = client.command(&["BOGUS"]).await.unwrap_err();
        assert!(matches!(err, CacheMgrError::RedisProtocol(_)));
    }

    #[tokio::test]
    async fn test_bulk_and_array_parsing() {
        let addr =
            one_shot_server(b"*3\r\n$4\r\nname\r\n$2\r\ng1\r\n:42\r\n").await;
        let mut client = RedisClient::connect(&addr, "", Duration::from_secs(1))
            .await
            .unwrap();
        let reply = client.command(&["X"]).await.unwrap();
        assert_eq!(
            reply,
            RespValue::Array(vec![
                RespValue::Data(b"name".to_vec()),
                RespValue::Data(b"g1".to_vec()),
                RespValue::Int(42),
            ])
        );
    }

    #[tokio::test]
    async fn test_nil_bulk() {
        let addr = one_shot_server(b"$-1\r\n").await;
        let mut client = RedisClient::connect(&addr, "", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(client.command(&["GET", "k"]).await.unwrap(), RespValue::Nil);
    }

    #[test]
    fn test_parse_info() {
        let text = "# Replication\r\nrole:slave\r\nmaster_addr:10.0.0.1:9221\r\nmaster_link_status:up\r\n\r\n";
        let map = parse_info(text);
        assert_eq!(map["role"], "slave");
        assert_eq!(map["master_addr"], "10.0.0.1:9221");
        assert_eq!(map["master_link_status"], "up");
        assert!(!map.contains_key("# Replication"));
    }

    #[test]
    fn test_string_map_of_pairs() {
        let v = RespValue::Array(vec![
            RespValue::Data(b"name".to_vec()),
            RespValue::Data(b"demo-g1".to_vec()),
            RespValue::Data(b"config-epoch".to_vec()),
            RespValue::Data(b"7".to_vec()),
        ]);
        let map = v.as_string_map().unwrap();
        assert_eq!(map["name"], "demo-g1");
        assert_eq!(map["config-epoch"], "7");
    }

    #[test]
    fn test_split_addr() {
        assert_eq!(
            split_addr("10.0.0.1:9221").unwrap(),
            ("10.0.0.1".to_string(), "9221".to_string())
        );
        assert!(split_addr("nocolon").is_err());
    }
}
