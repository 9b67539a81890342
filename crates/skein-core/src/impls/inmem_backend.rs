//! InMemoryBackend - 開発・テスト用の共有ストア
//!
//! Redis の sorted set / TTL key / SET NX EX を 1 プロセス内で再現します。
//! - sorted set: `BTreeSet<(score, member)>` + member -> score の索引
//! - TTL: 期限切れ key はアクセス時に遅延削除
//! - blocking pop: `Notify` で zadd を待つ（timeout 付き）
//! - `set_online(false)` で障害をシミュレート

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::StoreError;
use crate::ports::SharedBackend;

#[derive(Debug, Clone)]
struct Scored {
    score: f64,
    member: String,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // Same as Redis: by score, then lexicographically by member.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

#[derive(Default)]
struct SortedSet {
    entries: BTreeSet<Scored>,
    index: HashMap<String, f64>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: String) {
        if let Some(old) = self.index.insert(member.clone(), score) {
            self.entries.remove(&Scored {
                score: old,
                member: member.clone(),
            });
        }
        self.entries.insert(Scored { score, member });
    }

    fn pop_max(&mut self) -> Option<Scored> {
        let top = self.entries.pop_last()?;
        self.index.remove(&top.member);
        Some(top)
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct BackendState {
    zsets: HashMap<String, SortedSet>,
    keys: HashMap<String, Entry>,
}

impl BackendState {
    /// Drop `key` if it has expired, then return the live entry.
    fn live_entry(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        if self.keys.get(key).is_some_and(|e| !e.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get(key)
    }
}

/// In-process implementation of [`SharedBackend`].
///
/// Clone-free: share it behind an `Arc` between managers to emulate several
/// processes talking to one store.
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    notify: Notify,
    online: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            notify: Notify::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, AtomicOrdering::SeqCst);
        // wake blocked pops so they notice
        self.notify.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.online.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable(
                "in-memory backend is offline".to_string(),
            ))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedBackend for InMemoryBackend {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn zadd(&self, key: &str, score: f64, member: String) -> Result<(), StoreError> {
        self.check_online()?;
        self.state()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(score, member);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn bzpopmax(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<(String, f64)>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking, so a zadd in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_online()?;
            let top = self
                .state()
                .zsets
                .get_mut(key)
                .and_then(SortedSet::pop_max);
            if let Some(top) = top {
                return Ok(Some((top.member, top.score)));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        Ok(self
            .state()
            .zsets
            .get(key)
            .map(|z| z.entries.len())
            .unwrap_or(0))
    }

    async fn setex(&self, key: &str, ttl: Duration, value: String) -> Result<(), StoreError> {
        self.check_online()?;
        self.state().keys.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self.state().live_entry(key, now).map(|e| e.value.clone()))
    }

    async fn set_nx_ex(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let mut state = self.state();
        if state.live_entry(key, now).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.state().keys.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pops_highest_score_first() {
        let backend = InMemoryBackend::new();
        backend.zadd("q", 1.0, "low".into()).await.unwrap();
        backend.zadd("q", 3.0, "high".into()).await.unwrap();
        backend.zadd("q", 2.0, "normal".into()).await.unwrap();

        let mut order = Vec::new();
        while let Some((member, _)) = backend.bzpopmax("q", Duration::ZERO).await.unwrap() {
            order.push(member);
        }
        assert_eq!(order, vec!["high", "normal", "low"]);
        assert_eq!(backend.zcard("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zadd_same_member_updates_score() {
        let backend = InMemoryBackend::new();
        backend.zadd("q", 1.0, "a".into()).await.unwrap();
        backend.zadd("q", 5.0, "a".into()).await.unwrap();

        assert_eq!(backend.zcard("q").await.unwrap(), 1);
        let popped = backend.bzpopmax("q", Duration::ZERO).await.unwrap();
        assert_eq!(popped, Some(("a".to_string(), 5.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn bzpopmax_times_out_when_empty() {
        let backend = InMemoryBackend::new();
        let start = Instant::now();
        let popped = backend
            .bzpopmax("q", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(popped, None);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn zadd_wakes_blocked_pop() {
        let backend = Arc::new(InMemoryBackend::new());

        let waiter = tokio::spawn({
            let backend = Arc::clone(&backend);
            async move { backend.bzpopmax("q", Duration::from_secs(5)).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.zadd("q", 1.0, "task".into()).await.unwrap();

        let popped = waiter.await.unwrap();
        assert_eq!(popped.map(|(m, _)| m), Some("task".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_ex_is_exclusive_until_expiry() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(10);

        assert!(backend.set_nx_ex("lock:1", "w1".into(), ttl).await.unwrap());
        assert!(!backend.set_nx_ex("lock:1", "w2".into(), ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(backend.set_nx_ex("lock:1", "w2".into(), ttl).await.unwrap());
        assert_eq!(backend.get("lock:1").await.unwrap().as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn del_releases_lock() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(10);
        assert!(backend.set_nx_ex("lock:1", "w1".into(), ttl).await.unwrap());
        backend.del("lock:1").await.unwrap();
        assert!(backend.set_nx_ex("lock:1", "w2".into(), ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn setex_values_expire() {
        let backend = InMemoryBackend::new();
        backend
            .setex("result:1", Duration::from_secs(1), "v".into())
            .await
            .unwrap();
        assert_eq!(backend.get("result:1").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.get("result:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_backend_reports_unreachable() {
        let backend = InMemoryBackend::new();
        backend.set_online(false);
        assert!(matches!(
            backend.ping().await,
            Err(StoreError::Unreachable(_))
        ));
        assert!(backend.zadd("q", 1.0, "x".into()).await.is_err());

        backend.set_online(true);
        assert!(backend.ping().await.is_ok());
    }
}
