//! In-process caches owned by the queue managers.
//!
//! - SingleFlightCache: 同じ key への ensure を 1 つの in-flight future にまとめる。
//!   失敗した結果はキャッシュに残さない。成功した結果は clear() まで再利用する。
//!   待っている呼び出しが完了前に全員いなくなった flight も捨てる（timeout や select! での drop）。
//! - CountCache: pending 数の stale-while-revalidate キャッシュ。

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::domain::QueueResult;

type SharedResult<V> = Shared<BoxFuture<'static, QueueResult<V>>>;

struct Entry<V> {
    generation: u64,
    future: SharedResult<V>,
    /// この flight を await している呼び出しの数
    waiters: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // ロック中に await もパニックもしないので、poison されても中身は一貫している
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct SingleFlightCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    next_generation: AtomicU64,
}

/// 1 つの呼び出しが flight を待っている間だけ生きる。
/// 完了前に drop された最後の waiter が flight を捨てる。
struct Waiter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Arc<SingleFlightCache<K, V>>,
    key: K,
    generation: u64,
    future: SharedResult<V>,
}

impl<K, V> Drop for Waiter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let finished = self.future.peek().is_some();
        let abandoned = {
            let mut entries = lock(&self.cache.entries);
            match entries.get_mut(&self.key) {
                Some(entry) if entry.generation == self.generation => {
                    entry.waiters = entry.waiters.saturating_sub(1);
                    if entry.waiters == 0 && !finished {
                        entries.remove(&self.key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        // 途中の ensure はロックの外で drop する
        drop(abandoned);
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    /// key の in-flight / 完了済み結果を待つ。なければ `start` で作って登録する
    pub(crate) async fn get_or_start<F>(self: &Arc<Self>, key: K, start: impl FnOnce() -> F) -> QueueResult<V>
    where
        F: Future<Output = QueueResult<V>> + Send + 'static,
    {
        let waiter = self.join(key, start);
        let result = waiter.future.clone().await;
        drop(waiter);
        result
    }

    fn join<F>(self: &Arc<Self>, key: K, start: impl FnOnce() -> F) -> Waiter<K, V>
    where
        F: Future<Output = QueueResult<V>> + Send + 'static,
    {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(&key) {
            entry.waiters += 1;
            return Waiter {
                cache: self.clone(),
                key,
                generation: entry.generation,
                future: entry.future.clone(),
            };
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cache: Weak<Self> = Arc::downgrade(self);
        let evict_key = key.clone();
        let work = start();
        let future = async move {
            let result = work.await;
            if result.is_err()
                && let Some(cache) = cache.upgrade()
            {
                cache.evict_generation(&evict_key, generation);
            }
            result
        }
        .boxed()
        .shared();

        entries.insert(
            key.clone(),
            Entry {
                generation,
                future: future.clone(),
                waiters: 1,
            },
        );
        Waiter {
            cache: self.clone(),
            key,
            generation,
            future,
        }
    }

    /// 自分が登録したエントリのときだけ消す（clear 後に別の呼び出しが入れたものは残す）
    fn evict_generation(&self, key: &K, generation: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(key).is_some_and(|e| e.generation == generation) {
            entries.remove(key);
        }
    }

    pub(crate) fn evict(&self, key: &K) {
        lock(&self.entries).remove(key);
    }

    pub(crate) fn clear(&self) {
        lock(&self.entries).clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

#[derive(Debug, Clone, Copy)]
struct CountEntry {
    count: u64,
    last_updated: DateTime<Utc>,
}

/// lookup の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountLookup {
    /// まだ値がない（呼び出し側が最初の refresh を待つ）
    Missing,
    Fresh(u64),
    /// 古い値。refresh を始める責任は呼び出し側にある
    Stale(u64),
}

pub(crate) struct CountCache<K> {
    entries: Mutex<HashMap<K, CountEntry>>,
    max_age: Duration,
}

impl<K: Eq + Hash + Clone> CountCache<K> {
    pub(crate) fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    /// 古ければ last_updated を now にずらしてから Stale を返す。
    /// 同じ窓の中で 2 回目以降の呼び出しは Fresh になるので、refresh は窓ごとにほぼ 1 回。
    pub(crate) fn lookup(&self, key: &K, now: DateTime<Utc>) -> CountLookup {
        let mut entries = lock(&self.entries);
        match entries.get_mut(key) {
            None => CountLookup::Missing,
            Some(entry) if now - entry.last_updated > self.max_age => {
                entry.last_updated = now;
                CountLookup::Stale(entry.count)
            }
            Some(entry) => CountLookup::Fresh(entry.count),
        }
    }

    pub(crate) fn store(&self, key: K, count: u64, now: DateTime<Utc>) {
        lock(&self.entries).insert(
            key,
            CountEntry {
                count,
                last_updated: now,
            },
        );
    }
}
