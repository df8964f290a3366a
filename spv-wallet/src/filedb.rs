//! A minimal on-disk [`WalletDb`]: one JSON snapshot file plus one JSON
//! header-chunk file. Good enough for a CLI or desktop embedder; anything
//! wanting concurrent access or crash-atomicity guarantees beyond
//! rename-on-write should bring its own implementation.

use anyhow::{Context, Result};
use bitcoin::block::Header;
use spv_core::persistence::{Snapshot, WalletDb};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Headers round-trip through consensus hex, same convention as
/// [`spv_core::persistence::Snapshot`]'s transaction fields.
#[derive(Default, serde::Serialize, serde::Deserialize)]
struct HeaderStore(BTreeMap<u32, String>);

impl HeaderStore {
    fn get(&self, height: u32) -> Result<Option<Header>> {
        self.0
            .get(&height)
            .map(|hex| bitcoin::consensus::encode::deserialize_hex(hex).context("corrupt header entry"))
            .transpose()
    }

    fn insert(&mut self, height: u32, header: Header) {
        self.0
            .insert(height, bitcoin::consensus::encode::serialize_hex(&header));
    }
}

/// A [`WalletDb`] backed by two JSON files under `dir`: `snapshot.json` and
/// `headers.json`. Writes go through a temp file and an atomic rename.
pub struct FileWalletDb {
    snapshot_path: PathBuf,
    headers_path: PathBuf,
    headers: Mutex<Option<HeaderStore>>,
}

impl FileWalletDb {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            snapshot_path: dir.join("snapshot.json"),
            headers_path: dir.join("headers.json"),
            headers: Mutex::new(None),
        }
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_headers(&self) -> Result<HeaderStore> {
        match tokio::fs::read(&self.headers_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).context("corrupt header store")?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HeaderStore::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl WalletDb for FileWalletDb {
    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        Self::write_atomic(&self.snapshot_path, &json).await
    }

    async fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        match tokio::fs::read(&self.snapshot_path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).context("corrupt snapshot")?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn add_headers(&self, start: u32, headers: &[Header]) -> Result<()> {
        let mut guard = self.headers.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_headers().await?);
        }
        let store = guard.as_mut().expect("just populated");
        for (offset, header) in headers.iter().enumerate() {
            store.insert(start + offset as u32, *header);
        }
        let json = serde_json::to_vec_pretty(store)?;
        Self::write_atomic(&self.headers_path, &json).await
    }

    async fn get_header(&self, height: u32) -> Result<Option<Header>> {
        let mut guard = self.headers.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_headers().await?);
        }
        guard.as_ref().expect("just populated").get(height)
    }

    async fn get_headers(&self, start: u32, limit: u32) -> Result<Vec<Header>> {
        let mut guard = self.headers.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_headers().await?);
        }
        let store = guard.as_ref().expect("just populated");
        let mut headers = Vec::new();
        for height in start..start + limit {
            match store.get(height)? {
                Some(header) => headers.push(header),
                None => break,
            }
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;

    fn sample_header() -> Header {
        bitcoin::blockdata::constants::genesis_block(Network::Regtest).header
    }

    #[tokio::test]
    async fn round_trips_an_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileWalletDb::new(dir.path());
        assert!(db.read_snapshot().await.unwrap().is_none());

        let snapshot = Snapshot::default();
        db.persist(&snapshot).await.unwrap();
        let restored = db.read_snapshot().await.unwrap().unwrap();
        assert_eq!(restored, snapshot);
    }

    #[tokio::test]
    async fn stores_and_retrieves_headers() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileWalletDb::new(dir.path());
        let header = sample_header();
        db.add_headers(100, &[header]).await.unwrap();

        assert_eq!(db.get_header(100).await.unwrap(), Some(header));
        assert_eq!(db.get_header(101).await.unwrap(), None);
    }
}
