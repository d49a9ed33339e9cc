//! # Targets
//!
//! The function an executor runs on behalf of its callers, classified once
//! when it is bound: a plain function, an async function, or a generator
//! factory. The classification never changes per call.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use offrpc::Value;

use crate::generator::Abrupt;
use crate::generator::Co;
use crate::generator::Coroutine;
use crate::generator::Generator;

/// A value raised by a target in place of a result.
#[derive(Clone, Debug, PartialEq)]
pub struct Thrown(pub Value);

impl Thrown {
    /// Raises a plain message, e.g. `Thrown::msg("Error: bad input")`.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Value::String(message.into()))
    }

    /// Raises the display text of an error.
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::msg(error.to_string())
    }

    /// The textual description that crosses the boundary.
    pub fn to_text(&self) -> String {
        self.0.to_text()
    }
}

impl From<Value> for Thrown {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for Thrown {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<String> for Thrown {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

pub type PlainFn = dyn Fn(Vec<Value>) -> Result<Value, Thrown> + Send + Sync;
pub type AsyncFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, Thrown>> + Send + Sync;
pub type GeneratorFn = dyn Fn(Vec<Value>) -> Box<dyn Generator> + Send + Sync;

/// Static classification of a bound target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Plain,
    Async,
    Generator,
}

impl TargetKind {
    /// Whether invocations produce a session rather than a single value.
    pub fn is_generator(self) -> bool {
        self == TargetKind::Generator
    }
}

/// A function bound to an executor.
#[derive(Clone)]
pub enum Target {
    Plain(Arc<PlainFn>),
    Async(Arc<AsyncFn>),
    Generator(Arc<GeneratorFn>),
}

impl Target {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Thrown> + Send + Sync + 'static,
    {
        Target::Plain(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Thrown>> + Send + 'static,
    {
        Target::Async(Arc::new(move |args| f(args).boxed()))
    }

    /// Binds a factory returning any [`Generator`] implementation.
    pub fn generator<F, G>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> G + Send + Sync + 'static,
        G: Generator + 'static,
    {
        Target::Generator(Arc::new(move |args| Box::new(f(args)) as Box<dyn Generator>))
    }

    /// Binds a generator written as an async body that yields through [`Co`].
    pub fn coroutine<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>, Co) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Abrupt>> + Send + 'static,
    {
        let f = Arc::new(f);
        Target::generator(move |args| {
            let f = f.clone();
            Coroutine::new(move |co| f(args, co))
        })
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Plain(_) => TargetKind::Plain,
            Target::Async(_) => TargetKind::Async,
            Target::Generator(_) => TargetKind::Generator,
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target::{:?}", self.kind())
    }
}
