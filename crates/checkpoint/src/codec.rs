//! Opaque state serialization
//!
//! The manager never interprets training state; it hands it to a
//! [`StateCodec`] and stores whatever bytes come back.

use std::marker::PhantomData;

use bytes::Bytes;
use runtime_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Turns application state into bytes and back.
///
/// Failures must be reported as [`Error::Codec`].
pub trait StateCodec: Send + Sync {
    type State: Send;

    fn encode(&self, state: &Self::State) -> Result<Bytes>;

    fn decode(&self, bytes: Bytes) -> Result<Self::State>;
}

/// Identity codec: the state already is a byte blob
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl StateCodec for RawCodec {
    type State = Bytes;

    fn encode(&self, state: &Bytes) -> Result<Bytes> {
        Ok(state.clone())
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }
}

/// Bincode codec for any serde type
#[derive(Debug)]
pub struct BincodeCodec<T> {
    _state: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _state: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> StateCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    type State = T;

    fn encode(&self, state: &T) -> Result<Bytes> {
        bincode::serialize(state)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode(&self, bytes: Bytes) -> Result<T> {
        bincode::deserialize(&bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}
