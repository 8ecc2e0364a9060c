use crate::error::Result;

/// Persister is a durable key/value namespace scoped to a single operator.
/// Keys and values are opaque byte strings.
pub trait Persister: Send {
    /// Get a value from the in-memory view by key
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Stage a write in the in-memory view
    fn set(&mut self, key: &str, value: Vec<u8>);

    /// Remove a key from the in-memory view
    fn delete(&mut self, key: &str);

    /// Populate the in-memory view from durable storage
    fn load(&mut self) -> Result<()>;

    /// Commit staged writes to durable storage atomically
    fn sync(&self) -> Result<()>;
}

/// Typed helpers over the raw byte contract
pub trait PersisterExt: Persister {
    /// Get a value and deserialize it from JSON. Returns None if the key is
    /// absent or the stored bytes do not decode.
    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Stage a value serialized as JSON
    fn set_json<T: serde::Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes);
        Ok(())
    }
}

impl<T: Persister + ?Sized> PersisterExt for T {}
