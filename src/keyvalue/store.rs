use async_std::sync::RwLock;
use async_trait::async_trait;
use bytes::Bytes;

// The map type held by the store. Clones share structure, so taking a copy of
// the full contents is cheap regardless of its size.
pub type Contents = im::HashMap<Bytes, Bytes>;

// A key-value store where both the key and the value type are just bytes.
// Operations are atomic with respect to each other.
#[async_trait]
pub trait Store {
    async fn get(&self, key: &[u8]) -> Option<Bytes>;
    async fn set(&self, key: Bytes, value: Bytes);

    // Removes the supplied key. Deleting an absent key is not an error.
    async fn delete(&self, key: &[u8]);

    // Returns all keys currently present, in no particular order.
    async fn keys(&self) -> Vec<Bytes>;
}

// A store implementation backed by an in-memory immutable hash map.
pub struct MapStore {
    data: RwLock<Contents>,
}

impl MapStore {
    pub fn new() -> Self {
        MapStore {
            data: RwLock::new(Contents::new()),
        }
    }

    // Returns a point-in-time copy of everything in the store. Later writes to
    // the store are not visible in the returned map.
    pub async fn contents(&self) -> Contents {
        self.data.read().await.clone()
    }

    // Atomically swaps out the entire contents of the store.
    pub async fn replace(&self, contents: Contents) {
        *self.data.write().await = contents;
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

#[async_trait]
impl Store for MapStore {
    async fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().await.get(key).cloned()
    }

    async fn set(&self, key: Bytes, value: Bytes) {
        self.data.write().await.insert(key, value);
    }

    async fn delete(&self, key: &[u8]) {
        self.data.write().await.remove(key);
    }

    async fn keys(&self) -> Vec<Bytes> {
        self.data.read().await.keys().cloned().collect()
    }
}
