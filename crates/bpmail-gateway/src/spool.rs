//! Directory-backed bundle transport.
//!
//! Layout under the spool root:
//!
//! ```text
//! objects/<id>.bin                 staged payloads (transport storage)
//! topics/<topic>/queue/<entry>     deliveries waiting for a receiver
//! topics/<topic>/claimed/<entry>   deliveries held until released
//! ```
//!
//! Queue entries are small TOML documents referencing an object. A receiver
//! claims an entry by renaming it into `claimed/`, so concurrent receivers on
//! one topic never see the same delivery.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bpmail_core::transport::{
    CustodyPolicy, Delivery, DeliveryResult, Priority, SendRequest, SendStatus, StorageObject,
    Transport, TransportError,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue entry metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueueEntry {
    source_eid: String,
    dest_eid: String,
    profile_id: u32,
    priority: Priority,
    custody: CustodyPolicy,
    /// Storage object id in hex; TOML integers cannot hold every `u64`.
    object: String,
    length: u32,
    expires_unix_secs: u64,
}

/// Spool transport session bound to one topic.
#[derive(Debug)]
pub struct SpoolTransport {
    root: PathBuf,
    topic_id: u32,
    local_eid: String,
    lifespans: HashMap<u32, Duration>,
    receive_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl SpoolTransport {
    /// Attaches to the spool at `config.spool_dir` and opens `topic_id`.
    pub fn open(config: &GatewayConfig, topic_id: u32) -> Result<Self, TransportError> {
        let root = config.spool_dir.clone();
        if !root.is_dir() {
            return Err(TransportError::Attach(format!(
                "spool directory {} does not exist",
                root.display()
            )));
        }
        let transport = Self {
            root,
            topic_id,
            local_eid: config.local_eid.clone(),
            lifespans: config
                .profiles
                .iter()
                .map(|profile| (profile.id, Duration::from_secs(profile.lifespan_secs)))
                .collect(),
            receive_timeout: config.receive_timeout_secs.map(Duration::from_secs),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        for dir in [
            transport.objects_dir(),
            transport.queue_dir(),
            transport.claimed_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| TransportError::Open {
                topic: topic_id,
                reason: format!("{}: {err}", dir.display()),
            })?;
        }
        tracing::debug!(root = %transport.root.display(), topic_id, "opened spool topic");
        Ok(transport)
    }

    /// Overrides how often an empty queue is re-scanned.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Topic this session is bound to.
    #[must_use]
    pub fn topic_id(&self) -> u32 {
        self.topic_id
    }

    /// Number of deliveries waiting in the topic queue.
    pub fn queued(&self) -> Result<usize, TransportError> {
        Ok(self.queue_entries()?.len())
    }

    /// Number of payloads in transport storage.
    pub fn stored_objects(&self) -> Result<usize, TransportError> {
        let entries = fs::read_dir(self.objects_dir())
            .map_err(|err| TransportError::Storage(err.to_string()))?;
        Ok(entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "bin"))
            .count())
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn topic_dir(&self) -> PathBuf {
        self.root.join("topics").join(self.topic_id.to_string())
    }

    fn queue_dir(&self) -> PathBuf {
        self.topic_dir().join("queue")
    }

    fn claimed_dir(&self) -> PathBuf {
        self.topic_dir().join("claimed")
    }

    fn object_path(&self, object: StorageObject) -> PathBuf {
        self.objects_dir().join(format!("{:016x}.bin", object.0))
    }

    fn queue_entries(&self) -> Result<Vec<String>, TransportError> {
        let entries =
            fs::read_dir(self.queue_dir()).map_err(|err| TransportError::Receive(err.to_string()))?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.') && name.ends_with(".toml"))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Claims the oldest live queue entry, discarding expired ones.
    fn claim_next(&self) -> Result<Option<Delivery>, TransportError> {
        for name in self.queue_entries()? {
            let claimed = self.claimed_dir().join(&name);
            match fs::rename(self.queue_dir().join(&name), &claimed) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(TransportError::Receive(err.to_string())),
            }

            let entry = match read_entry(&claimed) {
                Ok(entry) => entry,
                Err(err) => {
                    self.discard_corrupt(&claimed);
                    return Err(err);
                }
            };
            let Some(object) = parse_object_id(&entry.object) else {
                self.discard_corrupt(&claimed);
                return Err(TransportError::Receive(format!(
                    "corrupt queue entry {name}: bad object id `{}`",
                    entry.object
                )));
            };
            if entry.expires_unix_secs <= unix_now() {
                tracing::warn!(
                    entry = %name,
                    source = %entry.source_eid,
                    "discarding expired delivery"
                );
                remove_quietly(&self.object_path(object));
                remove_quietly(&claimed);
                continue;
            }

            tracing::debug!(entry = %name, source = %entry.source_eid, "claimed delivery");
            return Ok(Some(Delivery {
                id: name,
                result: DeliveryResult::PayloadPresent,
                source_eid: entry.source_eid,
                length: entry.length,
                item: Some(object),
            }));
        }
        Ok(None)
    }

    /// Removes an unreadable claimed entry and any object it still names.
    fn discard_corrupt(&self, claimed: &Path) {
        let object = fs::read_to_string(claimed)
            .ok()
            .and_then(|data| toml::from_str::<toml::Table>(&data).ok())
            .and_then(|table| table.get("object")?.as_str().and_then(parse_object_id));
        tracing::warn!(path = %claimed.display(), "discarding corrupt queue entry");
        if let Some(object) = object {
            remove_quietly(&self.object_path(object));
        }
        remove_quietly(claimed);
    }

    fn enqueue(&self, entry: &QueueEntry) -> Result<(), TransportError> {
        let body = toml::to_string(entry).map_err(|err| TransportError::Send(err.to_string()))?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let name = format!("{nanos:020}-{:08x}.toml", rand::random::<u32>());
        let staging = self.queue_dir().join(format!(".{name}"));
        fs::write(&staging, body).map_err(|err| TransportError::Send(err.to_string()))?;
        fs::rename(&staging, self.queue_dir().join(&name))
            .map_err(|err| TransportError::Send(err.to_string()))
    }
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Delivery, TransportError> {
        let deadline = self.receive_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(delivery) = self.claim_next()? {
                return Ok(delivery);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(Delivery::without_payload(DeliveryResult::TimedOut));
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(topic_id = self.topic_id, "receive interrupted");
                    return Ok(Delivery::without_payload(DeliveryResult::Interrupted));
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn read_payload(&self, delivery: &Delivery) -> Result<Vec<u8>, TransportError> {
        let object = delivery
            .item
            .ok_or_else(|| TransportError::Read("delivery has no payload object".to_owned()))?;
        let bytes = fs::read(self.object_path(object))
            .map_err(|err| TransportError::Read(err.to_string()))?;
        if u32::try_from(bytes.len()).ok() != Some(delivery.length) {
            return Err(TransportError::Read(format!(
                "payload is {} bytes, delivery announced {}",
                bytes.len(),
                delivery.length
            )));
        }
        Ok(bytes)
    }

    fn release(&self, delivery: Delivery) {
        if let Some(object) = delivery.item {
            remove_quietly(&self.object_path(object));
        }
        if !delivery.id.is_empty() {
            remove_quietly(&self.claimed_dir().join(&delivery.id));
        }
    }

    fn insert(&self, bytes: &[u8]) -> Result<StorageObject, TransportError> {
        loop {
            let object = StorageObject(rand::random::<u64>());
            let file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.object_path(object));
            match file {
                Ok(mut file) => {
                    file.write_all(bytes)
                        .and_then(|()| file.sync_all())
                        .map_err(|err| TransportError::Storage(err.to_string()))?;
                    return Ok(object);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(TransportError::Storage(err.to_string())),
            }
        }
    }

    fn free(&self, object: StorageObject) -> Result<(), TransportError> {
        fs::remove_file(self.object_path(object))
            .map_err(|err| TransportError::Storage(err.to_string()))
    }

    fn send(&self, request: &SendRequest) -> Result<SendStatus, TransportError> {
        let Some(lifespan) = self.lifespans.get(&request.profile_id) else {
            tracing::warn!(profile = request.profile_id, "unknown transmission profile");
            return Ok(SendStatus::NotSent);
        };
        let object_path = self.object_path(request.payload);
        if !object_path.is_file() {
            return Err(TransportError::Send(format!(
                "storage object {:016x} does not exist",
                request.payload.0
            )));
        }

        self.enqueue(&QueueEntry {
            source_eid: self.local_eid.clone(),
            dest_eid: request.dest_eid.clone(),
            profile_id: request.profile_id,
            priority: request.priority,
            custody: request.custody,
            object: format!("{:016x}", request.payload.0),
            length: request.length,
            expires_unix_secs: unix_now().saturating_add(lifespan.as_secs()),
        })?;
        Ok(SendStatus::Accepted)
    }
}

fn read_entry(path: &Path) -> Result<QueueEntry, TransportError> {
    let data = fs::read_to_string(path).map_err(|err| TransportError::Receive(err.to_string()))?;
    toml::from_str(&data).map_err(|err| {
        TransportError::Receive(format!("corrupt queue entry {}: {err}", path.display()))
    })
}

fn parse_object_id(hex: &str) -> Option<StorageObject> {
    u64::from_str_radix(hex, 16).ok().map(StorageObject)
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "could not release spool file");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
