//! Stream routing combinators
//!
//! Pipeline stages are wired from small [`Handler`]s. A [`Partition`] sends
//! each input to the first route that accepts it and discards the rest
//! through a fallback; a [`Broadcast`] hands a copy of each input to every
//! branch and waits for all of them, reporting each branch on its own.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::error::{ServiceError, ServiceResult};

/// A consumer of pipeline inputs
#[async_trait]
pub trait Handler<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn handle(&self, input: T) -> ServiceResult<()>;
}

/// Handler built from an async closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`]
pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ServiceResult<()>>,
{
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = ServiceResult<()>> + Send,
{
    async fn handle(&self, input: T) -> ServiceResult<()> {
        (self.f)(input).await
    }
}

/// Fallback that drops its input
pub struct Discard {
    name: String,
}

impl Discard {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl<T: Send + 'static> Handler<T> for Discard {
    async fn handle(&self, _input: T) -> ServiceResult<()> {
        trace!(partition = %self.name, "No route matched, discarding input");
        Ok(())
    }
}

type Route<T> = Box<dyn Fn(T) -> Result<BoxFuture<'static, ServiceResult<()>>, T> + Send + Sync>;

/// First-match router
pub struct Partition<T> {
    routes: Vec<Route<T>>,
    fallback: Arc<dyn Handler<T>>,
}

impl<T: Send + 'static> Partition<T> {
    /// Create a partition whose unmatched inputs are discarded
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            routes: Vec::new(),
            fallback: Arc::new(Discard::new(name)),
        }
    }

    /// Add a route that accepts an input by extracting a value from it.
    ///
    /// `extract` hands the input back untouched when the route does not apply.
    pub fn route<S, X>(mut self, extract: X, handler: Arc<dyn Handler<S>>) -> Self
    where
        S: Send + 'static,
        X: Fn(T) -> Result<S, T> + Send + Sync + 'static,
    {
        self.routes.push(Box::new(move |input: T| {
            let handler = Arc::clone(&handler);
            extract(input).map(|accepted| async move { handler.handle(accepted).await }.boxed())
        }));
        self
    }

    /// Add a route taken when `predicate` holds
    pub fn when<P>(self, predicate: P, handler: Arc<dyn Handler<T>>) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.route(
            move |input: T| if predicate(&input) { Ok(input) } else { Err(input) },
            handler,
        )
    }

    /// Replace the discarding fallback
    pub fn fallback(mut self, handler: Arc<dyn Handler<T>>) -> Self {
        self.fallback = handler;
        self
    }
}

#[async_trait]
impl<T: Send + 'static> Handler<T> for Partition<T> {
    async fn handle(&self, input: T) -> ServiceResult<()> {
        let mut input = input;
        for route in &self.routes {
            match route(input) {
                Ok(run) => return run.await,
                Err(rejected) => input = rejected,
            }
        }
        self.fallback.handle(input).await
    }
}

/// Result of one broadcast branch
#[derive(Debug)]
pub struct BranchOutcome {
    pub branch: String,
    pub result: ServiceResult<()>,
}

/// Fan-out to every branch
pub struct Broadcast<T> {
    name: String,
    branches: Vec<(String, Arc<dyn Handler<T>>)>,
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
        }
    }

    /// Add a named branch
    pub fn branch(mut self, name: impl Into<String>, handler: Arc<dyn Handler<T>>) -> Self {
        self.branches.push((name.into(), handler));
        self
    }

    /// Run every branch concurrently and collect one outcome per branch.
    ///
    /// A failing branch does not cancel its siblings.
    pub async fn dispatch(&self, input: T) -> Vec<BranchOutcome> {
        let runs = self.branches.iter().map(|(name, handler)| {
            let input = input.clone();
            async move {
                BranchOutcome {
                    branch: name.clone(),
                    result: handler.handle(input).await,
                }
            }
        });
        join_all(runs).await
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Handler<T> for Broadcast<T> {
    async fn handle(&self, input: T) -> ServiceResult<()> {
        let failed: Vec<String> = self
            .dispatch(input)
            .await
            .into_iter()
            .filter_map(|outcome| match outcome.result {
                Ok(()) => None,
                Err(err) => {
                    warn!(broadcast = %self.name, branch = %outcome.branch, error = %err, "Branch failed");
                    Some(format!("{}: {}", outcome.branch, err))
                }
            })
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::BranchesFailed(failed.join("; ")))
        }
    }
}
