//! A single-resolution completion handle with `then`/`fail` chaining and
//! `all` aggregation, playing the role the original implementation's
//! `QRpcPromise` (itself a thin wrapper around `QtPromise::QPromise`) plays
//! there, built here on `tokio::sync::oneshot` instead of Qt signals.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// The producer side of a [`Promise`]. Settling is idempotent: once
/// `resolve` or `reject` has been called, further calls are silently
/// ignored rather than panicking, since a handler and a teardown path can
/// race to settle the same promise.
pub struct Resolver<T> {
    sender: Option<oneshot::Sender<Result<T, String>>>,
}

impl<T> Resolver<T> {
    pub fn resolve(&mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Ok(value));
        }
    }

    pub fn reject(&mut self, message: impl Into<String>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(message.into()));
        }
    }
}

/// A promise of a value of type `T`, settling to either `Ok(T)` or
/// `Err(message)`. Implements [`Future`] so the ordinary `.await` is the
/// primary way to consume it; `then`/`fail`/`wait`/`all` provide the rest
/// of the combinator surface.
pub struct Promise<T> {
    receiver: oneshot::Receiver<Result<T, String>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a fresh, unsettled promise and the resolver that settles it.
    pub fn pending() -> (Resolver<T>, Promise<T>) {
        let (tx, rx) = oneshot::channel();
        (Resolver { sender: Some(tx) }, Promise { receiver: rx })
    }

    /// Creates an already-settled promise, e.g. for an immediate handler
    /// result or a teardown rejection issued before any work starts.
    pub fn settled(result: Result<T, String>) -> Promise<T> {
        let (mut resolver, promise) = Promise::pending();
        match result {
            Ok(v) => resolver.resolve(v),
            Err(e) => resolver.reject(e),
        }
        promise
    }

    /// Chains a transformation onto this promise's success value, returning
    /// a new promise immediately without blocking. A rejection passes
    /// through unchanged.
    pub fn then<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (mut resolver, promise) = Promise::pending();
        tokio::spawn(async move {
            match self.await {
                Ok(v) => resolver.resolve(f(v)),
                Err(e) => resolver.reject(e),
            }
        });
        promise
    }

    /// Blocking consumption for synchronous call sites. Panics if invoked
    /// from inside a tokio runtime thread, the same restriction the
    /// original implementation documents but cannot enforce structurally --
    /// here `blocking_recv` enforces it for us.
    pub fn wait(self) -> Result<T, String> {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err("promise dropped without resolution".to_string()))
    }
}

impl Promise<crate::value::Value> {
    /// Recovery hook: translates a rejection back into a successful value.
    pub fn fail<F>(self, f: F) -> Promise<crate::value::Value>
    where
        F: FnOnce(String) -> crate::value::Value + Send + 'static,
    {
        let (mut resolver, promise) = Promise::pending();
        tokio::spawn(async move {
            match self.await {
                Ok(v) => resolver.resolve(v),
                Err(e) => resolver.resolve(f(e)),
            }
        });
        promise
    }

    /// Awaits every promise concurrently, then returns their results in
    /// input order. Settles successfully iff all inputs resolve; on
    /// failure, propagates the first-by-index rejection.
    pub fn all(promises: Vec<Promise<crate::value::Value>>) -> Promise<Vec<crate::value::Value>> {
        let (mut resolver, promise) = Promise::pending();
        tokio::spawn(async move {
            let handles: Vec<_> = promises.into_iter().map(tokio::spawn).collect();
            let mut results = Vec::with_capacity(handles.len());
            let mut first_error: Option<String> = None;
            for handle in handles {
                match handle.await {
                    Ok(Ok(v)) => results.push(v),
                    Ok(Err(e)) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(join_err) => {
                        if first_error.is_none() {
                            first_error = Some(format!("promise task failed: {join_err}"));
                        }
                    }
                }
            }
            match first_error {
                Some(e) => resolver.reject(e),
                None => resolver.resolve(results),
            }
        });
        promise
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err("promise dropped without resolution".to_string())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[tokio::test]
    async fn resolve_and_await() {
        let (mut resolver, promise) = Promise::pending();
        resolver.resolve(42);
        assert_eq!(promise.await, Ok(42));
    }

    #[tokio::test]
    async fn reject_and_await() {
        let (mut resolver, promise) = Promise::<i32>::pending();
        resolver.reject("boom");
        assert_eq!(promise.await, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn second_settlement_is_ignored() {
        let (mut resolver, promise) = Promise::pending();
        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject("nope");
        assert_eq!(promise.await, Ok(1));
    }

    #[tokio::test]
    async fn then_chains_transformation() {
        let (mut resolver, promise) = Promise::pending();
        let chained = promise.then(|v: i32| v + 1);
        resolver.resolve(41);
        assert_eq!(chained.await, Ok(42));
    }

    #[tokio::test]
    async fn then_passes_through_rejection() {
        let (mut resolver, promise) = Promise::<i32>::pending();
        let chained = promise.then(|v| v + 1);
        resolver.reject("bad");
        assert_eq!(chained.await, Err("bad".to_string()));
    }

    #[tokio::test]
    async fn fail_recovers_rejection() {
        let (mut resolver, promise) = Promise::<Value>::pending();
        let recovered = promise.fail(|_e| Value::Int(0));
        resolver.reject("bad");
        assert_eq!(recovered.await, Ok(Value::Int(0)));
    }

    #[tokio::test]
    async fn all_resolves_in_input_order() {
        let (mut r1, p1) = Promise::<Value>::pending();
        let (mut r2, p2) = Promise::<Value>::pending();
        let combined = Promise::all(vec![p1, p2]);
        r2.resolve(Value::Int(2));
        r1.resolve(Value::Int(1));
        assert_eq!(
            combined.await,
            Ok(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[tokio::test]
    async fn all_propagates_first_rejection_by_index() {
        let (mut r1, p1) = Promise::<Value>::pending();
        let (mut r2, p2) = Promise::<Value>::pending();
        let combined = Promise::all(vec![p1, p2]);
        r2.reject("second failed");
        r1.reject("first failed");
        assert_eq!(combined.await, Err("first failed".to_string()));
    }
}
