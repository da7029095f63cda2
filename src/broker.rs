//! Multi-topic broker tying journals, topics, and the topic directory
//! together.

use crate::error::{Result, TopicError};
use crate::topic::{Topic, TopicConfig};
use crate::types::{MessageInput, Offset, PullBatch, TopicStats};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Magic bytes for the broker manifest.
const BROKER_MAGIC: &[u8; 4] = b"TQB\0";

/// Current broker format version.
const BROKER_VERSION: u8 = 1;

/// Magic bytes for the topic directory file.
const DIRECTORY_MAGIC: &[u8; 4] = b"TQD\0";

/// Current topic directory format version.
const DIRECTORY_VERSION: u8 = 1;

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Base path for the broker.
    pub path: PathBuf,

    /// Whether to create the broker directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Configuration applied to every topic this broker opens.
    pub topic: TopicConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./broker"),
            create_if_missing: true,
            topic: TopicConfig::default(),
        }
    }
}

/// Persisted list of topics this broker has created, in creation order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TopicDirectory {
    names: Vec<String>,
}

/// The broker: a set of named, fully independent topics under one
/// directory.
///
/// Topics are opened lazily on first use and cached; each owns its own
/// journal, lock, and waiter registry, so operations on different topics
/// never contend.
pub struct Broker {
    /// Broker configuration.
    config: BrokerConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Open topics by name.
    topics: RwLock<HashMap<String, Arc<Topic>>>,

    /// Persisted topic directory.
    directory: Mutex<TopicDirectory>,
}

impl Broker {
    /// Open an existing broker or create a new one.
    pub fn open_or_create(config: BrokerConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(TopicError::NotInitialized)
        }
    }

    /// Create a new broker.
    pub fn create(config: BrokerConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join("topics"))?;

        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        info!(path = %config.path.display(), "created broker");

        let broker = Self {
            config,
            _lock_file: lock_file,
            topics: RwLock::new(HashMap::new()),
            directory: Mutex::new(TopicDirectory::default()),
        };
        broker.save_directory()?;

        Ok(broker)
    }

    /// Open an existing broker.
    pub fn open(config: BrokerConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let directory = Self::load_directory(&config.path)?;
        info!(
            path = %config.path.display(),
            topics = directory.names.len(),
            "opened broker"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            topics: RwLock::new(HashMap::new()),
            directory: Mutex::new(directory),
        })
    }

    // --- Topics ---

    /// Get a handle to the named topic, creating it on first use.
    ///
    /// The same `Arc<Topic>` is returned to every caller, so pulls and
    /// publishes from different threads land on one actor instance.
    pub fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }

        let mut topics = self.topics.write();
        // Raced with another opener between the locks.
        if let Some(topic) = topics.get(name) {
            return Ok(Arc::clone(topic));
        }

        let path = self.journal_path(name);
        let topic = Arc::new(Topic::open(name, path, self.config.topic.clone())?);
        topics.insert(name.to_string(), Arc::clone(&topic));

        {
            let mut directory = self.directory.lock();
            if !directory.names.iter().any(|n| n == name) {
                directory.names.push(name.to_string());
                Self::persist_directory(&self.config.path, &directory)?;
            }
        }

        Ok(topic)
    }

    /// Get a handle to the named topic only if it already exists.
    pub fn existing_topic(&self, name: &str) -> Result<Arc<Topic>> {
        let known = self.directory.lock().names.iter().any(|n| n == name);
        if !known {
            return Err(TopicError::TopicNotFound(name.to_string()));
        }
        self.topic(name)
    }

    /// Names of all topics ever created through this broker, in creation
    /// order.
    pub fn topic_names(&self) -> Vec<String> {
        self.directory.lock().names.clone()
    }

    /// Close one topic: wake its parked pullers and drop it from the
    /// cache. The journal stays on disk; the next `topic()` call reopens it.
    pub fn close_topic(&self, name: &str) {
        if let Some(topic) = self.topics.write().remove(name) {
            topic.close();
        }
    }

    // --- Convenience operations (topic resolved by name) ---

    /// Publish to the named topic.
    pub fn publish(&self, topic: &str, input: MessageInput) -> Result<Offset> {
        self.topic(topic)?.publish(input)
    }

    /// Publish with a deduplication key.
    pub fn publish_with_dedup(
        &self,
        topic: &str,
        input: MessageInput,
        dedup_key: &str,
    ) -> Result<Offset> {
        self.topic(topic)?.publish_with_dedup(input, dedup_key)
    }

    /// Pull from the named topic with the configured timeout.
    pub fn pull(&self, topic: &str, offset: Option<Offset>) -> Result<PullBatch> {
        self.topic(topic)?.pull(offset)
    }

    /// Truncate the named topic.
    pub fn truncate(&self, topic: &str, count: u64) -> Result<Offset> {
        self.topic(topic)?.truncate(count)
    }

    /// Stats for the named topic.
    pub fn stats(&self, topic: &str) -> Result<TopicStats> {
        Ok(self.topic(topic)?.stats())
    }

    // --- Maintenance ---

    /// Sync every open topic's journal to disk.
    pub fn sync(&self) -> Result<()> {
        for topic in self.topics.read().values() {
            topic.sync()?;
        }
        Ok(())
    }

    /// Close every open topic.
    pub fn close(&self) {
        let mut topics = self.topics.write();
        for (_, topic) in topics.drain() {
            topic.close();
        }
    }

    /// Get the broker path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    /// Journal file for a topic. Names are hashed so arbitrary topic keys
    /// stay filesystem-safe.
    fn journal_path(&self, name: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.config.path.join("topics").join(format!("{}.log", digest))
    }

    fn save_directory(&self) -> Result<()> {
        let directory = self.directory.lock();
        Self::persist_directory(&self.config.path, &directory)
    }

    fn persist_directory(path: &Path, directory: &TopicDirectory) -> Result<()> {
        let tmp_path = path.join("topics.bin.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(DIRECTORY_MAGIC)?;
            file.write_all(&[DIRECTORY_VERSION])?;
            let encoded = rmp_serde::to_vec(directory)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, path.join("topics.bin"))?;
        Ok(())
    }

    fn load_directory(path: &Path) -> Result<TopicDirectory> {
        let directory_path = path.join("topics.bin");
        if !directory_path.exists() {
            return Ok(TopicDirectory::default());
        }

        let mut file = File::open(directory_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != DIRECTORY_MAGIC {
            return Err(TopicError::InvalidFormat("Invalid directory magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != DIRECTORY_VERSION {
            return Err(TopicError::InvalidFormat(format!(
                "Unsupported directory version: {}",
                version[0]
            )));
        }

        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded)?;
        Ok(rmp_serde::from_slice(&encoded)?)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(BROKER_MAGIC)?;
        file.write_all(&[BROKER_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BROKER_MAGIC {
            return Err(TopicError::InvalidFormat("Invalid broker magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BROKER_VERSION {
            return Err(TopicError::InvalidFormat(format!(
                "Unsupported broker version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| TopicError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // Best-effort sync on drop.
        let _ = self.sync();
    }
}
