//! Memoize successful results of an async function.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::hash::Hash;

/// Caches `Ok` results by key. Errors are never cached, so a failed key is
/// attempted again on the next call.
pub struct Memoize<A, K, V, E> {
    f: Box<dyn Fn(A) -> BoxFuture<'static, Result<V, E>> + Send + Sync>,
    key_fn: Box<dyn Fn(&A) -> K + Send + Sync>,
    cache: DashMap<K, V>,
}

impl<A, K, V, E> Memoize<A, K, V, E>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new<F, Fut, KF>(f: F, key_fn: KF) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        KF: Fn(&A) -> K + Send + Sync + 'static,
    {
        Self {
            f: Box::new(move |args| f(args).boxed()),
            key_fn: Box::new(key_fn),
            cache: DashMap::new(),
        }
    }

    pub async fn call(&self, args: A) -> Result<V, E> {
        let key = (self.key_fn)(&args);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.value().clone());
        }

        let value = (self.f)(args).await?;
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    /// Forget a single cached key.
    pub fn invalidate(&self, key: &K) -> bool {
        self.cache.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
