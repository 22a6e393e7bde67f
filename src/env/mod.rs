//! Per-request environment bag and route captures.
//!
//! Every [`Request`](crate::Request) carries an [`Extensions`] map that stages
//! and handlers use to pass computed per-request state down the chain (for
//! example the negotiated accept preferences), and a [`Params`] map holding
//! the values captured by parameterized route segments.

use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Type-erased per-request state map, keyed by value type.
///
/// Stages annotate the request without knowing about each other's types;
/// handlers read back with [`Extensions::get`].
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Creates an empty extensions map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any existing value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns a reference to the stored value of type `T`, if any.
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns a mutable reference to the stored value of type `T`, if any.
    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes and returns the stored value of type `T`, if any.
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Returns `true` if nothing has been attached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Values captured from parameterized route segments (`:name`).
#[derive(Default, Debug, Clone)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    /// Creates an empty capture map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a captured value under the parameter name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.map.insert(name.into(), value.into());
    }

    /// Returns the captured value for `name`, if the matched route bound it.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the matched route had no parameterized segments.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
