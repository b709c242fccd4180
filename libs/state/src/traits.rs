//! Pool State Capability Traits
//!
//! The store is generic over one small interface per pool family: which calls
//! rebuild the state, how to decode them, and which handler applies each event.

use crate::aggregator::{AggregatorError, BatchCall};
use crate::events::{Address, DecodeError, EventLog};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;

/// Error types for state store operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Rebuild of {identifier} failed: {source}")]
    Rebuild {
        identifier: String,
        #[source]
        source: AggregatorError,
    },

    #[error("Rebuild of {identifier} returned undecodable state: {source}")]
    Decode {
        identifier: String,
        #[source]
        source: DecodeError,
    },

    #[error("Store {0} has been released")]
    Released(String),

    #[error("State for {0} is unavailable")]
    Unavailable(String),
}

pub type EventHandler<S> = Box<dyn Fn(&mut S, &EventLog) -> Result<(), DecodeError> + Send + Sync>;

/// Event name to handler table, built once when a store is created.
///
/// Unregistered event names resolve to `None` and are ignored by the store.
pub struct EventHandlers<S> {
    handlers: HashMap<String, EventHandler<S>>,
}

impl<S> Default for EventHandlers<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> EventHandlers<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, event_name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut S, &EventLog) -> Result<(), DecodeError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_name.into(), Box::new(handler));
        self
    }

    pub fn get(&self, event_name: &str) -> Option<&EventHandler<S>> {
        self.handlers.get(event_name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Capability interface implemented once per pool family
pub trait PoolStateSource: Send + Sync + 'static {
    /// Decoded pool state; serialized when shared between processes
    type State: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Value produced by each rebuild call
    type CallOutput: Send + 'static;

    /// Tokens this pool can swap between
    fn tokens(&self) -> &[Address];

    /// Whether pricing may assume fee-on-transfer tokens are handled
    fn supports_fee_on_transfer(&self) -> bool {
        false
    }

    /// Cheap pre-filter: does this log concern this pool at all
    fn is_relevant(&self, log: &EventLog) -> bool;

    /// Calls that, read at one height, fully determine the state
    fn on_chain_calls(&self) -> Vec<BatchCall<Self::CallOutput>>;

    /// Build the state from the outputs of [`Self::on_chain_calls`], in order
    fn decode_on_chain_calls(&self, outputs: Vec<Self::CallOutput>)
        -> Result<Self::State, DecodeError>;

    fn register_handlers(&self, handlers: &mut EventHandlers<Self::State>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_event_is_absent() {
        let mut handlers: EventHandlers<u64> = EventHandlers::new();
        handlers
            .register("Deposit", |state, _| {
                *state += 1;
                Ok(())
            })
            .register("Withdraw", |state, _| {
                *state -= 1;
                Ok(())
            });

        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers.event_names(), vec!["Deposit", "Withdraw"]);
        assert!(handlers.get("Sync").is_none());

        let log = EventLog::new(Address::zero(), "Deposit", vec![], 1, 0);
        let mut state = 5;
        (handlers.get("Deposit").unwrap())(&mut state, &log).unwrap();
        assert_eq!(state, 6);
    }
}
