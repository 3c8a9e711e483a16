use std::marker::PhantomData;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts values to and from the byte representation stored in the remote
/// cache.
///
/// `deserialize(serialize(v))` must be an identity for every value the
/// computation can produce. The debouncer never inspects the bytes.
pub trait Serializer<V>: Send + Sync {
    /// Encodes a value for the remote cache.
    fn serialize(&self, value: &V) -> anyhow::Result<Vec<u8>>;

    /// Decodes a remote cache entry.
    fn deserialize(&self, data: &[u8]) -> anyhow::Result<V>;
}

/// Structural binary encoding via bincode.
pub struct BincodeSerializer<V> {
    _values: PhantomData<fn() -> V>,
}

impl<V> BincodeSerializer<V> {
    /// Creates the serializer.
    pub fn new() -> Self {
        BincodeSerializer {
            _values: PhantomData,
        }
    }
}

impl<V> Default for BincodeSerializer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Serializer<V> for BincodeSerializer<V>
where
    V: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &V) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(value).context("bincode encoding failed")
    }

    fn deserialize(&self, data: &[u8]) -> anyhow::Result<V> {
        bincode::deserialize(data).context("bincode decoding failed")
    }
}

/// JSON encoding, for caches shared with readers in other languages.
pub struct JsonSerializer<V> {
    _values: PhantomData<fn() -> V>,
}

impl<V> JsonSerializer<V> {
    /// Creates the serializer.
    pub fn new() -> Self {
        JsonSerializer {
            _values: PhantomData,
        }
    }
}

impl<V> Default for JsonSerializer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Serializer<V> for JsonSerializer<V>
where
    V: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &V) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(value).context("json encoding failed")
    }

    fn deserialize(&self, data: &[u8]) -> anyhow::Result<V> {
        serde_json::from_slice(data).context("json decoding failed")
    }
}
