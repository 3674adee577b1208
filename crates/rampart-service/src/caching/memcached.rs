//! Memcached cluster client, ASCII protocol.
//!
//! Keys are distributed over the node list with a ketama-style hash ring
//! so that membership changes only perturb a small fraction of keys. Each
//! node keeps a small pool of idle connections; a node that fails
//! repeatedly is declared down, logged, and skipped on the ring until a
//! probe window reopens it. When every node is down the primary candidate
//! is attempted anyway so that a recovered cluster heals without
//! intervention.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::MemcachedConfig;
use crate::utils::ErrorChain;

use super::ClusterError;

/// Points per node on the hash ring.
const VIRTUAL_NODES: usize = 40;

/// One pooled protocol connection.
struct Connection<S> {
    stream: BufStream<S>,
    line: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            line: Vec::with_capacity(64),
        }
    }

    async fn read_line(&mut self) -> Result<String, ClusterError> {
        self.line.clear();
        let n = self.stream.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            return Err(ClusterError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let mut line = String::from_utf8_lossy(&self.line).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
            return Err(ClusterError::Protocol(line));
        }
        Ok(line)
    }

    /// `get <key>`, returning the value or `None` on miss.
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        self.stream
            .write_all(format!("get {key}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;

        let header = self.read_line().await?;
        if header == "END" {
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes>
        let length = header
            .strip_prefix("VALUE ")
            .and_then(|rest| rest.split_ascii_whitespace().nth(2))
            .and_then(|len| len.parse::<usize>().ok())
            .ok_or_else(|| ClusterError::Protocol(header.clone()))?;

        let mut value = vec![0u8; length];
        self.stream.read_exact(&mut value).await?;
        let mut crlf = [0u8; 2];
        self.stream.read_exact(&mut crlf).await?;

        let trailer = self.read_line().await?;
        if trailer != "END" {
            return Err(ClusterError::Protocol(trailer));
        }
        Ok(Some(value))
    }

    /// `set`/`add`, returning whether the value was stored.
    async fn store(
        &mut self,
        verb: &str,
        key: &str,
        value: &[u8],
        ttl_seconds: u32,
    ) -> Result<bool, ClusterError> {
        let header = format!("{verb} {key} 0 {ttl_seconds} {}\r\n", value.len());
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(value).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        match self.read_line().await?.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" => Ok(false),
            other => Err(ClusterError::Protocol(other.to_owned())),
        }
    }

    /// `delete <key>`; deleting an absent key is fine.
    async fn delete(&mut self, key: &str) -> Result<(), ClusterError> {
        self.stream
            .write_all(format!("delete {key}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;

        match self.read_line().await?.as_str() {
            "DELETED" | "NOT_FOUND" => Ok(()),
            other => Err(ClusterError::Protocol(other.to_owned())),
        }
    }
}

struct Node {
    addr: String,
    pool: Mutex<Vec<Connection<TcpStream>>>,
    consecutive_failures: AtomicU32,
    dead_until: Mutex<Option<Instant>>,
}

impl Node {
    fn new(addr: String) -> Self {
        Self {
            addr,
            pool: Mutex::new(Vec::new()),
            consecutive_failures: AtomicU32::new(0),
            dead_until: Mutex::new(None),
        }
    }

    fn is_alive(&self) -> bool {
        let mut dead_until = self.dead_until.lock();
        match *dead_until {
            Some(instant) if Instant::now() < instant => false,
            Some(_) => {
                // probe window: let one round of traffic try again
                *dead_until = None;
                true
            }
            None => true,
        }
    }

    async fn checkout(&self, config: &MemcachedConfig) -> Result<Connection<TcpStream>, ClusterError> {
        if let Some(conn) = self.pool.lock().pop() {
            return Ok(conn);
        }
        let connect = TcpStream::connect(&self.addr);
        let stream = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| ClusterError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream))
    }

    fn checkin(&self, conn: Connection<TcpStream>, config: &MemcachedConfig) {
        let mut pool = self.pool.lock();
        if pool.len() < config.pool_size {
            pool.push(conn);
        }
    }

    fn note_ok(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.dead_until.lock() = None;
    }

    /// Records a failure; returns whether the node was just declared down.
    fn note_failure(&self, config: &MemcachedConfig) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < config.failure_threshold {
            return false;
        }
        let mut dead_until = self.dead_until.lock();
        let newly_down = dead_until.is_none();
        *dead_until = Some(Instant::now() + config.retry_dead_after);
        newly_down
    }
}

enum Command<'a> {
    Get,
    Set { value: &'a [u8], ttl: u32 },
    Add { value: &'a [u8], ttl: u32 },
    Delete,
}

enum Reply {
    Value(Option<Vec<u8>>),
    Stored(bool),
    Done,
}

/// Client for a memcached cluster, one [`Node`] per configured address.
pub struct MemcachedCluster {
    nodes: Vec<Node>,
    ring: BTreeMap<u64, usize>,
    config: MemcachedConfig,
}

impl std::fmt::Debug for MemcachedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedCluster")
            .field("nodes", &self.nodes.iter().map(|n| &n.addr).collect::<Vec<_>>())
            .finish()
    }
}

impl MemcachedCluster {
    pub fn new(addrs: &[String], config: MemcachedConfig) -> Result<Self, ClusterError> {
        if addrs.is_empty() {
            return Err(ClusterError::NoNodes);
        }

        let nodes: Vec<_> = addrs.iter().cloned().map(Node::new).collect();
        let mut ring = BTreeMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for replica in 0..VIRTUAL_NODES {
                ring.insert(xxh3_64(format!("{}#{replica}", node.addr).as_bytes()), index);
            }
        }

        Ok(Self {
            nodes,
            ring,
            config,
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        match self.execute(key, Command::Get).await? {
            Reply::Value(value) => Ok(value),
            _ => Err(ClusterError::Protocol("unexpected reply".into())),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: u32) -> Result<bool, ClusterError> {
        match self.execute(key, Command::Set { value, ttl }).await? {
            Reply::Stored(stored) => Ok(stored),
            _ => Err(ClusterError::Protocol("unexpected reply".into())),
        }
    }

    pub async fn add(&self, key: &str, value: &[u8], ttl: u32) -> Result<bool, ClusterError> {
        match self.execute(key, Command::Add { value, ttl }).await? {
            Reply::Stored(stored) => Ok(stored),
            _ => Err(ClusterError::Protocol("unexpected reply".into())),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), ClusterError> {
        self.execute(key, Command::Delete).await.map(|_| ())
    }

    /// Runs one command against the node owning `key`, with the pool,
    /// timeout and health bookkeeping shared by all operations.
    async fn execute(&self, key: &str, command: Command<'_>) -> Result<Reply, ClusterError> {
        let node = self.node_for(key)?;

        let mut conn = match node.checkout(&self.config).await {
            Ok(conn) => conn,
            Err(err) => return Err(self.fail(node, err)),
        };

        let op = async {
            match command {
                Command::Get => conn.get(key).await.map(Reply::Value),
                Command::Set { value, ttl } => {
                    conn.store("set", key, value, ttl).await.map(Reply::Stored)
                }
                Command::Add { value, ttl } => {
                    conn.store("add", key, value, ttl).await.map(Reply::Stored)
                }
                Command::Delete => conn.delete(key).await.map(|()| Reply::Done),
            }
        };

        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(Ok(reply)) => {
                node.note_ok();
                node.checkin(conn, &self.config);
                Ok(reply)
            }
            Ok(Err(err)) => Err(self.fail(node, err)),
            Err(_) => Err(self.fail(node, ClusterError::Timeout)),
        }
    }

    /// Picks the first alive node at or after the key's point on the
    /// ring, falling back to the primary candidate when all are down.
    fn node_for(&self, key: &str) -> Result<&Node, ClusterError> {
        let hash = xxh3_64(key.as_bytes());
        let candidates = self
            .ring
            .range(hash..)
            .chain(self.ring.range(..hash))
            .map(|(_, &index)| index);

        let mut primary = None;
        for index in candidates {
            let node = &self.nodes[index];
            if primary.is_none() {
                primary = Some(node);
            }
            if node.is_alive() {
                return Ok(node);
            }
        }
        primary.ok_or(ClusterError::NoNodes)
    }

    fn fail(&self, node: &Node, err: ClusterError) -> ClusterError {
        if node.note_failure(&self.config) {
            tracing::warn!(
                node = %node.addr,
                error = %ErrorChain(&err),
                "memcached node declared down",
            );
        }
        err
    }
}
