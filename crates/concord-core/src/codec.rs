use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use concord_types::ConcordError;

/// Converts logical keys and values to the bytes stored by partitions.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>, ConcordError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, ConcordError>;
}

/// Compact binary encoding via bincode's serde support.
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        BincodeCodec(PhantomData)
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

impl<T: Serialize + DeserializeOwned + 'static> Codec<T> for BincodeCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, ConcordError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ConcordError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, ConcordError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ConcordError::Codec(e.to_string()))?;
        Ok(value)
    }
}

/// Human-readable encoding; handy for maps inspected by operators.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned + 'static> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, ConcordError> {
        serde_json::to_vec(value).map_err(|e| ConcordError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, ConcordError> {
        serde_json::from_slice(bytes).map_err(|e| ConcordError::Codec(e.to_string()))
    }
}
