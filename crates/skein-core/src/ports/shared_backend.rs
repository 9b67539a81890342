//! SharedBackend port - 共有 KV ストア（Redis など）
//!
//! 分散キューがストアに要求する操作だけを定義します。
//! - sorted set: `zadd` / `bzpopmax` / `zcard`（優先度キュー）
//! - TTL 付き key: `setex` / `get`（結果キャッシュ）
//! - `set_nx_ex` / `del`（排他ロック）
//!
//! # 実装
//! - **InMemoryBackend**: 開発・テスト用（`impls::inmem_backend`）

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::StoreError;

/// Wire-level operations of a key/sorted-set store with blocking pop and TTL keys.
///
/// Members and values are opaque strings; encoding is the caller's business.
#[async_trait]
pub trait SharedBackend: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert `member` into the sorted set at `key` with `score`.
    async fn zadd(&self, key: &str, score: f64, member: String) -> Result<(), StoreError>;

    /// Pop the highest-scored member, waiting up to `timeout` for one to appear.
    async fn bzpopmax(&self, key: &str, timeout: Duration)
        -> Result<Option<(String, f64)>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    async fn setex(&self, key: &str, ttl: Duration, value: String) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `key` only if absent, expiring after `ttl`. Returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: String, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;
}
