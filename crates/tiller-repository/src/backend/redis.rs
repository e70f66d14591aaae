//! Redis backend implementation.
//!
//! Plain operations go through a shared [`ConnectionManager`]; transactions
//! use `MULTI`/`EXEC` pipelines; the compare-and-set primitive opens a
//! dedicated connection so its `WATCH` cannot observe another task's
//! traffic.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info};

use tiller_core::{Error, Result};

use super::{Backend, CasOutcome, InsertPosition, KeyKind, WriteOp};

/// Redis-backed [`Backend`] for production deployments.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

fn backend_err(op: &'static str) -> impl FnOnce(redis::RedisError) -> Error {
    move |err| Error::backend_with_source(format!("redis {op} failed"), err)
}

impl RedisBackend {
    /// Connects to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the URL is invalid or the initial
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("connecting to redis backend");

        let client = redis::Client::open(url).map_err(backend_err("client open"))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(backend_err("connect"))?;

        Ok(Self { client, conn })
    }

    fn apply_to_pipe(pipe: &mut redis::Pipeline, op: WriteOp) {
        match op {
            WriteOp::Del { key } => {
                pipe.del(key).ignore();
            }
            WriteOp::Set { key, value } => {
                pipe.set(key, value).ignore();
            }
            WriteOp::HSet { key, fields } => {
                pipe.hset_multiple(key, &fields).ignore();
            }
            WriteOp::HDel { key, fields } => {
                pipe.hdel(key, fields).ignore();
            }
            WriteOp::SAdd { key, member } => {
                pipe.sadd(key, member).ignore();
            }
            WriteOp::SRem { key, member } => {
                pipe.srem(key, member).ignore();
            }
            WriteOp::ZAdd { key, score, member } => {
                pipe.zadd(key, member, score).ignore();
            }
            WriteOp::ZRem { key, member } => {
                pipe.zrem(key, member).ignore();
            }
            WriteOp::RPush { key, values } => {
                pipe.rpush(key, values).ignore();
            }
            WriteOp::LRem { key, value } => {
                pipe.lrem(key, 0, value).ignore();
            }
            WriteOp::LInsert {
                key,
                position,
                pivot,
                value,
            } => {
                match position {
                    InsertPosition::Before => pipe.linsert_before(key, pivot, value),
                    InsertPosition::After => pipe.linsert_after(key, pivot, value),
                }
                .ignore();
            }
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(backend_err("GET"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(backend_err("EXISTS"))
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        let mut conn = self.conn.clone();
        let kind: String = redis::cmd("TYPE")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err("TYPE"))?;
        match kind.as_str() {
            "none" => Ok(KeyKind::Missing),
            "string" => Ok(KeyKind::String),
            "hash" => Ok(KeyKind::Hash),
            "list" => Ok(KeyKind::List),
            "set" => Ok(KeyKind::Set),
            "zset" => Ok(KeyKind::SortedSet),
            other => Err(Error::backend(format!(
                "unrecognized key type '{other}' for {key}"
            ))),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(backend_err("HGET"))
    }

    async fn hget_many(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hget(key, field);
        }
        pipe.query_async(&mut conn)
            .await
            .map_err(backend_err("pipelined HGET"))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(backend_err("HGETALL"))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(backend_err("SMEMBERS"))
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.zrevrange(key, start, stop)
            .await
            .map_err(backend_err("ZREVRANGE"))
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start, stop)
            .await
            .map_err(backend_err("LRANGE"))
    }

    async fn read_hash_and_list(
        &self,
        hash_key: &str,
        list_key: &str,
    ) -> Result<(HashMap<String, String>, Vec<String>)> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hgetall(hash_key)
            .lrange(list_key, 0, -1)
            .query_async(&mut conn)
            .await
            .map_err(backend_err("snapshot read"))
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            Self::apply_to_pipe(&mut pipe, op);
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend_err("MULTI/EXEC"))
    }

    async fn hset_if_unchanged(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<CasOutcome> {
        // WATCH semantics require a connection nothing else is using.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_err("dedicated connection"))?;

        redis::cmd("WATCH")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err("WATCH"))?;

        let current: Option<String> = conn.hget(key, field).await.map_err(backend_err("HGET"))?;
        if current.as_deref() != expected {
            redis::cmd("UNWATCH")
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend_err("UNWATCH"))?;
            debug!(key, field, "value moved before transaction started");
            return Ok(CasOutcome::Conflict);
        }

        // EXEC returns nil when the watched key was touched by another
        // client, surfaced here as None.
        let exec: Option<(i64,)> = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .query_async(&mut conn)
            .await
            .map_err(backend_err("MULTI/EXEC"))?;

        Ok(if exec.is_some() {
            CasOutcome::Applied
        } else {
            CasOutcome::Conflict
        })
    }
}
