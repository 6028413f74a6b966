use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use cantaloupe_proto::{ChannelName, ClientId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::ChannelLimits;
use crate::error::{Error, Result};

use super::{ClientRecord, MemoryStore, RecoveredState, Store, StoredMessage, SubscriptionRecord};

const SERVER_FILE: &str = "server.json";
const CLIENTS_FILE: &str = "clients.log";
const CHANNELS_DIR: &str = "channels";
const MSGS_FILE: &str = "msgs.log";
const SUBS_FILE: &str = "subs.log";

/// Upper bound for one log record; anything larger is treated as a
/// torn write
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A [`Store`] persisting to append-only logs under a directory
///
/// Every mutation is framed with a length and crc32 checksum and
/// appended to the matching log; the working set is a write-through
/// [`MemoryStore`]. On open the directory must either be fresh or
/// have been written under the same cluster id.
///
/// Layout: `server.json`, `clients.log`, and per channel
/// `channels/<name>/{msgs.log,subs.log}`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    cache: MemoryStore,
    had_state: bool,
    files: Mutex<Files>,
}

#[derive(Debug, Default)]
struct Files {
    clients: Option<File>,
    channels: HashMap<ChannelName, ChannelFiles>,
    closed: bool,
}

#[derive(Debug)]
struct ChannelFiles {
    msgs: File,
    subs: File,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerFile {
    cluster_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
enum ClientLogRecord {
    Add(ClientRecord),
    Delete { id: ClientId },
}

#[derive(Debug, Serialize, Deserialize)]
enum SubLogRecord {
    Create(SubscriptionRecord),
    Update(SubscriptionRecord),
    Delete { sub_id: u64 },
    AddPending { sub_id: u64, sequence: u64 },
    AckPending { sub_id: u64, sequence: u64 },
}

impl FileStore {
    /// Open or create a file store in `dir`
    ///
    /// # Errors
    ///
    /// It returns an error if the directory cannot be prepared or was
    /// written under a different cluster id.
    pub fn open(dir: &Path, cluster_id: &str, limits: ChannelLimits) -> Result<Self> {
        fs::create_dir_all(dir.join(CHANNELS_DIR))?;

        let server_path = dir.join(SERVER_FILE);
        let had_state = server_path.exists();
        if had_state {
            let raw = fs::read(&server_path)?;
            let server: ServerFile = serde_json::from_slice(&raw)
                .map_err(|_| Error::Corrupt("unreadable server file"))?;
            if server.cluster_id != cluster_id {
                return Err(Error::ClusterIdMismatch {
                    expected: cluster_id.to_owned(),
                    found: server.cluster_id,
                });
            }
        } else {
            let server = ServerFile {
                cluster_id: cluster_id.to_owned(),
            };
            fs::write(
                &server_path,
                serde_json::to_vec(&server).map_err(std::io::Error::other)?,
            )?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            cache: MemoryStore::new(limits),
            had_state,
            files: Mutex::new(Files::default()),
        })
    }

    fn lock_files(&self) -> Result<MutexGuard<'_, Files>> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        if files.closed {
            return Err(Error::Shutdown);
        }
        Ok(files)
    }

    fn channel_dir(&self, channel: &ChannelName) -> PathBuf {
        self.dir.join(CHANNELS_DIR).join(channel.as_str())
    }

    fn open_channel_files(&self, files: &mut Files, channel: &ChannelName) -> Result<()> {
        if files.channels.contains_key(channel) {
            return Ok(());
        }

        let dir = self.channel_dir(channel);
        fs::create_dir_all(&dir)?;
        files.channels.insert(
            channel.clone(),
            ChannelFiles {
                msgs: open_append(&dir.join(MSGS_FILE))?,
                subs: open_append(&dir.join(SUBS_FILE))?,
            },
        );
        Ok(())
    }

    fn append_client_record(&self, record: &ClientLogRecord) -> Result<()> {
        let mut files = self.lock_files()?;
        if files.clients.is_none() {
            files.clients = Some(open_append(&self.dir.join(CLIENTS_FILE))?);
        }
        let file = files.clients.as_mut().expect("opened above");
        append_frame(file, record)
    }

    fn append_sub_record(&self, channel: &ChannelName, record: &SubLogRecord) -> Result<()> {
        let mut files = self.lock_files()?;
        self.open_channel_files(&mut files, channel)?;
        let channel_files = files
            .channels
            .get_mut(channel)
            .expect("opened above");
        append_frame(&mut channel_files.subs, record)
    }

    fn replay_channel(&self, channel: &ChannelName) -> Result<()> {
        self.cache.create_channel(channel)?;

        let dir = self.channel_dir(channel);
        for msg in read_frames::<StoredMessage>(&dir.join(MSGS_FILE))? {
            self.cache.restore_msg(channel, msg)?;
        }

        for record in read_frames::<SubLogRecord>(&dir.join(SUBS_FILE))? {
            match record {
                SubLogRecord::Create(record) => self.cache.create_sub(&record)?,
                SubLogRecord::Update(record) => self.cache.update_sub(&record)?,
                SubLogRecord::Delete { sub_id } => self.cache.delete_sub(channel, sub_id)?,
                SubLogRecord::AddPending { sub_id, sequence } => {
                    self.cache.add_seq_pending(channel, sub_id, sequence)?;
                }
                SubLogRecord::AckPending { sub_id, sequence } => {
                    self.cache.ack_seq_pending(channel, sub_id, sequence)?;
                }
            }
        }

        Ok(())
    }
}

impl Store for FileStore {
    fn recover(&self) -> Result<Option<RecoveredState>> {
        if !self.had_state {
            return Ok(None);
        }

        for record in read_frames::<ClientLogRecord>(&self.dir.join(CLIENTS_FILE))? {
            match record {
                ClientLogRecord::Add(record) => self.cache.add_client(&record)?,
                ClientLogRecord::Delete { id } => self.cache.delete_client(&id)?,
            }
        }

        for entry in fs::read_dir(self.dir.join(CHANNELS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Ok(channel) =
                ChannelName::try_from(name.to_string_lossy().into_owned())
            else {
                tracing::warn!(dir = %name.to_string_lossy(), "skipping unrecognized channel dir");
                continue;
            };

            self.replay_channel(&channel)?;

            let mut files = self.lock_files()?;
            self.open_channel_files(&mut files, &channel)?;
        }

        let state = self.cache.recovered_state();
        tracing::info!(
            clients = state.clients.len(),
            channels = state.channels.len(),
            "recovered file store",
        );
        Ok(Some(state))
    }

    fn has_channel(&self, channel: &ChannelName) -> bool {
        self.cache.has_channel(channel)
    }

    fn create_channel(&self, channel: &ChannelName) -> Result<()> {
        self.cache.create_channel(channel)?;
        let mut files = self.lock_files()?;
        self.open_channel_files(&mut files, channel)
    }

    fn store_msg(
        &self,
        channel: &ChannelName,
        payload: Bytes,
        timestamp_nanos: i64,
    ) -> Result<u64> {
        let sequence = self
            .cache
            .store_msg(channel, payload.clone(), timestamp_nanos)?;

        let mut files = self.lock_files()?;
        self.open_channel_files(&mut files, channel)?;
        let channel_files = files.channels.get_mut(channel).expect("opened above");
        append_frame(
            &mut channel_files.msgs,
            &StoredMessage {
                sequence,
                payload,
                timestamp_nanos,
            },
        )?;
        Ok(sequence)
    }

    fn lookup_msg(&self, channel: &ChannelName, sequence: u64) -> Result<Option<StoredMessage>> {
        self.cache.lookup_msg(channel, sequence)
    }

    fn first_sequence(&self, channel: &ChannelName) -> Result<u64> {
        self.cache.first_sequence(channel)
    }

    fn last_sequence(&self, channel: &ChannelName) -> Result<u64> {
        self.cache.last_sequence(channel)
    }

    fn sequence_for_timestamp(&self, channel: &ChannelName, timestamp_nanos: i64) -> Result<u64> {
        self.cache.sequence_for_timestamp(channel, timestamp_nanos)
    }

    fn create_sub(&self, record: &SubscriptionRecord) -> Result<()> {
        self.cache.create_sub(record)?;
        self.append_sub_record(&record.channel, &SubLogRecord::Create(record.clone()))
    }

    fn update_sub(&self, record: &SubscriptionRecord) -> Result<()> {
        self.cache.update_sub(record)?;
        self.append_sub_record(&record.channel, &SubLogRecord::Update(record.clone()))
    }

    fn delete_sub(&self, channel: &ChannelName, sub_id: u64) -> Result<()> {
        self.cache.delete_sub(channel, sub_id)?;
        self.append_sub_record(channel, &SubLogRecord::Delete { sub_id })
    }

    fn add_seq_pending(&self, channel: &ChannelName, sub_id: u64, sequence: u64) -> Result<()> {
        self.cache.add_seq_pending(channel, sub_id, sequence)?;
        self.append_sub_record(channel, &SubLogRecord::AddPending { sub_id, sequence })
    }

    fn ack_seq_pending(&self, channel: &ChannelName, sub_id: u64, sequence: u64) -> Result<()> {
        self.cache.ack_seq_pending(channel, sub_id, sequence)?;
        self.append_sub_record(channel, &SubLogRecord::AckPending { sub_id, sequence })
    }

    fn add_client(&self, record: &ClientRecord) -> Result<()> {
        self.cache.add_client(record)?;
        self.append_client_record(&ClientLogRecord::Add(record.clone()))
    }

    fn delete_client(&self, client_id: &ClientId) -> Result<()> {
        self.cache.delete_client(client_id)?;
        self.append_client_record(&ClientLogRecord::Delete {
            id: client_id.clone(),
        })
    }

    fn close(&self) -> Result<()> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        if files.closed {
            return Ok(());
        }
        files.closed = true;

        if let Some(clients) = &files.clients {
            clients.sync_all()?;
        }
        for channel_files in files.channels.values() {
            channel_files.msgs.sync_all()?;
            channel_files.subs.sync_all()?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn append_frame<T: Serialize>(file: &mut File, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value).map_err(std::io::Error::other)?;

    #[expect(clippy::cast_possible_truncation, reason = "records are far below u32::MAX")]
    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    file.write_all(&frame)?;
    Ok(())
}

/// Read every intact frame; a torn or corrupt tail ends the log
fn read_frames<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut records = Vec::new();
    let mut rest = raw.as_slice();
    while rest.len() >= 8 {
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let Some(body) = rest.get(8..8 + len.min(MAX_FRAME_LEN)) else {
            break;
        };
        if len > MAX_FRAME_LEN || body.len() != len || crc32fast::hash(body) != crc {
            tracing::warn!(path = %path.display(), "dropping corrupt log tail");
            break;
        }

        match serde_json::from_slice(body) {
            Ok(record) => records.push(record),
            Err(_) => {
                tracing::warn!(path = %path.display(), "dropping undecodable log tail");
                break;
            }
        }
        rest = &rest[8 + len..];
    }
    if !rest.is_empty() && rest.len() < 8 {
        tracing::warn!(path = %path.display(), "dropping torn log tail");
    }

    Ok(records)
}
