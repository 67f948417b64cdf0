use super::{Config, Error};
use bytes::{Buf, BufMut};
use std::{collections::BTreeMap, path::PathBuf};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};

const BLOB_NAMES: [&str; 2] = ["left", "right"];

/// Size of the version prefix.
const VERSION_SIZE: usize = 8;

/// Size of the checksum suffix.
const CHECKSUM_SIZE: usize = 4;

/// Largest blob that will be read on startup.
const MAX_BLOB_SIZE: u64 = 16 * 1024 * 1024;

/// A blob recovered from disk.
struct Recovered {
    version: u64,
    map: BTreeMap<String, Vec<u8>>,
}

/// Implementation of [Metadata] storage.
pub struct Metadata {
    cfg: Config,

    cursor: usize,
    version: u64,
    blobs: [File; 2],

    map: BTreeMap<String, Vec<u8>>,
}

impl Metadata {
    /// Initialize a new [Metadata] instance, recovering the latest committed state.
    pub async fn init(cfg: Config) -> Result<Self, Error> {
        // Open dedicated blobs
        let partition = cfg.partition_path();
        fs::create_dir_all(&partition).await?;
        let mut left = Self::open(partition.join(BLOB_NAMES[0])).await?;
        let mut right = Self::open(partition.join(BLOB_NAMES[1])).await?;

        // Recover both blobs, discarding any that are corrupt
        let left_result = Self::recover(&mut left, BLOB_NAMES[0]).await?;
        let right_result = Self::recover(&mut right, BLOB_NAMES[1]).await?;

        // Choose the latest blob
        let (cursor, version, map) = match (left_result, right_result) {
            (Some(left), Some(right)) if right.version > left.version => {
                (1, right.version, right.map)
            }
            (Some(left), _) => (0, left.version, left.map),
            (None, Some(right)) => (1, right.version, right.map),
            (None, None) => (0, 0, BTreeMap::new()),
        };
        debug!(partition = %cfg.partition, version, keys = map.len(), "loaded metadata");

        Ok(Self {
            cfg,
            cursor,
            version,
            blobs: [left, right],
            map,
        })
    }

    async fn open(path: PathBuf) -> Result<File, Error> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?)
    }

    async fn recover(blob: &mut File, name: &str) -> Result<Option<Recovered>, Error> {
        // Get blob length
        let len = blob.metadata().await?.len();
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_BLOB_SIZE {
            return Err(Error::BlobTooLarge(len));
        }

        // Read blob
        let mut buf = Vec::with_capacity(len as usize);
        blob.seek(std::io::SeekFrom::Start(0)).await?;
        blob.read_to_end(&mut buf).await?;

        // Verify integrity
        match Self::parse(&buf) {
            Some(recovered) => Ok(Some(recovered)),
            None => {
                warn!(blob = name, len, "corrupt metadata blob: truncating");
                blob.set_len(0).await?;
                blob.sync_all().await?;
                Ok(None)
            }
        }
    }

    /// Decode a blob, returning `None` if it is truncated or fails its checksum.
    fn parse(buf: &[u8]) -> Option<Recovered> {
        if buf.len() < VERSION_SIZE + CHECKSUM_SIZE {
            return None;
        }
        let (body, checksum) = buf.split_at(buf.len() - CHECKSUM_SIZE);
        let stored = u32::from_be_bytes(checksum.try_into().ok()?);
        if stored != crc32fast::hash(body) {
            return None;
        }

        let mut body = body;
        let version = body.get_u64();
        let mut map = BTreeMap::new();
        while body.has_remaining() {
            let key = Self::read_field(&mut body)?;
            let key = String::from_utf8(key).ok()?;
            let value = Self::read_field(&mut body)?;
            map.insert(key, value);
        }
        Some(Recovered { version, map })
    }

    fn read_field(buf: &mut &[u8]) -> Option<Vec<u8>> {
        if buf.remaining() < 4 {
            return None;
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return None;
        }
        let field = buf[..len].to_vec();
        buf.advance(len);
        Some(field)
    }

    fn encode(&self, version: u64) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        buf.put_u64(version);
        for (key, value) in &self.map {
            let key_len = u32::try_from(key.len()).map_err(|_| Error::KeyTooBig(key.clone()))?;
            let value_len =
                u32::try_from(value.len()).map_err(|_| Error::ValueTooBig(key.clone()))?;
            buf.put_u32(key_len);
            buf.put_slice(key.as_bytes());
            buf.put_u32(value_len);
            buf.put_slice(value);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        Ok(buf)
    }

    /// Get a value from [Metadata] (if it exists).
    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.map.get(key)
    }

    /// Put a value into [Metadata].
    ///
    /// If the key already exists, the value will be overwritten. The
    /// value stored will not be persisted until [Metadata::sync] is called.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.map.insert(key.into(), value);
    }

    /// Remove a value from [Metadata] (if it exists).
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.map.remove(key)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Atomically commit the current state of [Metadata].
    ///
    /// The state is written to the older of the two blobs, so the newer blob remains intact
    /// until the write has been synced.
    pub async fn sync(&mut self) -> Result<(), Error> {
        let version = self.version + 1;
        let buf = self.encode(version)?;

        // Overwrite the older blob
        let next = 1 - self.cursor;
        let blob = &mut self.blobs[next];
        blob.seek(std::io::SeekFrom::Start(0)).await?;
        blob.write_all(&buf).await?;
        blob.flush().await?;
        blob.set_len(buf.len() as u64).await?;
        blob.sync_all().await?;

        // Only now does the new state take precedence
        self.cursor = next;
        self.version = version;
        debug!(partition = %self.cfg.partition, version, "synced metadata");
        Ok(())
    }

    /// Sync outstanding changes and close the store.
    pub async fn close(mut self) -> Result<(), Error> {
        self.sync().await
    }

    /// Remove all persisted data.
    pub async fn destroy(self) -> Result<(), Error> {
        let partition = self.cfg.partition_path();
        drop(self.blobs);
        fs::remove_dir_all(partition).await?;
        Ok(())
    }
}
