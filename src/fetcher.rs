//! External collaborator boundary.
//!
//! The cache never talks to the data service itself; the surrounding
//! application supplies a [`Fetcher`] per query and a [`Mutator`] per write.
//! Failures surface as [`FetchError`]; retry policy, if any, lives behind
//! these traits.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;
use crate::key::QueryKey;

/// Reads the authoritative value for a key from the backing data service.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError>;
}

/// Executes a write against the backing data service, returning the
/// confirmed value.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn execute(&self, variables: &Value) -> Result<Value, FetchError>;
}

type BoxFetchFuture = Pin<Box<dyn Future<Output = Result<Value, FetchError>> + Send>>;

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher {
    f: Box<dyn Fn(QueryKey) -> BoxFetchFuture + Send + Sync>,
}

impl FnFetcher {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |key| Box::pin(f(key))),
        }
    }
}

#[async_trait]
impl Fetcher for FnFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        (self.f)(key.clone()).await
    }
}

/// Adapter turning an async closure into a [`Mutator`].
pub struct FnMutator {
    f: Box<dyn Fn(Value) -> BoxFetchFuture + Send + Sync>,
}

impl FnMutator {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |variables| Box::pin(f(variables))),
        }
    }
}

#[async_trait]
impl Mutator for FnMutator {
    async fn execute(&self, variables: &Value) -> Result<Value, FetchError> {
        (self.f)(variables.clone()).await
    }
}
