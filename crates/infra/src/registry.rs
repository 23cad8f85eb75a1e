//! Capability registry: picks the implementation that handles an input.
//!
//! Entries are consulted in registration order and the first one whose
//! predicate accepts the input wins. An input nobody accepts is an explicit
//! [`UnsupportedOperation`], never a silent no-op.

use thiserror::Error;

/// An implementation that declares which inputs it handles.
pub trait Capability<Input: ?Sized> {
    fn name(&self) -> &str;

    fn supports(&self, input: &Input) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no registered operation supports this input (registered: {registered:?})")]
pub struct UnsupportedOperation {
    pub registered: Vec<String>,
}

#[derive(Debug)]
pub struct OperationRegistry<T> {
    entries: Vec<T>,
}

impl<T> Default for OperationRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> OperationRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn with(mut self, entry: T) -> Self {
        self.register(entry);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn select<I: ?Sized>(&self, input: &I) -> Result<&T, UnsupportedOperation>
    where
        T: Capability<I>,
    {
        self.entries
            .iter()
            .find(|entry| entry.supports(input))
            .ok_or_else(|| UnsupportedOperation {
                registered: self.entries.iter().map(|e| e.name().to_string()).collect(),
            })
    }
}
