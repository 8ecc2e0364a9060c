// SPDX-License-Identifier: Apache-2.0

//! File input operator.
//!
//! Discovers files matching the configured glob patterns, reads one entry
//! per line as files grow, follows renames by content fingerprint, and
//! persists per-file offsets so a restart resumes exactly where the last
//! run acknowledged.

mod finder;
mod fingerprint;
mod reader;

pub use finder::Finder;
pub use fingerprint::Fingerprint;
pub use reader::{FileReader, LogEncoding, PendingRecord, ReadSettings, ReaderRecord, RecordBody};

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entry::{Entry, Field};
use crate::error::{Error, Result};
use crate::operator::{BuildContext, Operator, OperatorDescriptor, Outputs, WorkerHandle};
use crate::persistence::{Persister, ScopedPersister};
use reader::RecordBody as Body;

const KNOWN_FILES_KEY: &str = "knownFiles";

/// Readers whose path has been absent for more than this many polls are
/// dropped at the next state sync
const UNSEEN_POLL_LIMIT: u32 = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartAt {
    Beginning,
    #[default]
    End,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInputConfig {
    /// Glob patterns of files to tail; required, non-empty
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Where to start in files first observed during the first poll
    #[serde(default)]
    pub start_at: StartAt,
    /// Records longer than this are truncated and flagged
    #[serde(default = "default_max_log_size")]
    pub max_log_size: usize,
    #[serde(default = "default_fingerprint_bytes")]
    pub fingerprint_bytes: usize,
    #[serde(default)]
    pub encoding: LogEncoding,
    /// Optional field to stamp the source path onto each entry
    #[serde(default)]
    pub file_path_field: Option<Field>,
    /// Optional field to stamp the source file name onto each entry
    #[serde(default)]
    pub file_name_field: Option<Field>,
    /// Drop undecodable records instead of emitting a synthetic error record
    #[serde(default)]
    pub drop_on_error: bool,
}

fn default_poll_interval() -> f64 {
    0.2
}

fn default_max_log_size() -> usize {
    1024 * 1024
}

fn default_fingerprint_bytes() -> usize {
    1000
}

impl Default for FileInputConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            poll_interval: default_poll_interval(),
            start_at: StartAt::default(),
            max_log_size: default_max_log_size(),
            fingerprint_bytes: default_fingerprint_bytes(),
            encoding: LogEncoding::default(),
            file_path_field: None,
            file_name_field: None,
            drop_on_error: false,
        }
    }
}

/// How emitted entries are decorated
#[derive(Debug)]
struct Decorations {
    file_path_field: Option<Field>,
    file_name_field: Option<Field>,
    drop_on_error: bool,
}

/// The file input operator. A source: it has no input channel.
pub struct FileInput {
    id: String,
    output_ids: Vec<String>,
    config: FileInputConfig,
    finder: Finder,
    persister: Option<ScopedPersister>,
    outputs: Option<Outputs>,
    worker: WorkerHandle,
}

impl FileInput {
    pub fn new(
        id: impl Into<String>,
        output_ids: Vec<String>,
        config: FileInputConfig,
        persister: ScopedPersister,
    ) -> Result<Self> {
        let id = id.into();
        if !(config.poll_interval.is_finite() && config.poll_interval > 0.0) {
            return Err(Error::Config(format!(
                "operator '{}': poll_interval must be a positive number of seconds",
                id
            )));
        }
        let finder = Finder::new(config.include.clone(), &config.exclude)?;
        Ok(Self {
            id,
            output_ids,
            config,
            finder,
            persister: Some(persister),
            outputs: None,
            worker: WorkerHandle::new(),
        })
    }
}

pub(crate) fn build(
    descriptor: &OperatorDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Operator>> {
    let config: FileInputConfig = descriptor.decode_settings()?;
    let persister = context.database.offsets_persister(&descriptor.id);
    Ok(Box::new(FileInput::new(
        descriptor.id.clone(),
        descriptor.outputs.clone(),
        config,
        persister,
    )?))
}

#[async_trait]
impl Operator for FileInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        "file_input"
    }

    fn output_ids(&self) -> &[String] {
        &self.output_ids
    }

    fn connect_outputs(&mut self, outputs: Outputs) {
        self.outputs = Some(outputs);
    }

    async fn start(&mut self) -> Result<()> {
        let mut persister = self
            .persister
            .take()
            .ok_or_else(|| Error::Config(format!("operator '{}' started twice", self.id)))?;

        persister
            .load()
            .map_err(|e| e.in_stage(format!("read known files for operator '{}'", self.id)))?;
        let known = load_known_files(&persister)
            .map_err(|e| e.in_stage(format!("decode known files for operator '{}'", self.id)))?;

        info!(
            operator_id = %self.id,
            operator_type = "file_input",
            known_files = known.len(),
            "starting file input"
        );

        let tailer = Tailer {
            operator_id: self.id.clone(),
            include: self.config.include.clone(),
            finder: self.finder.clone(),
            settings: ReadSettings {
                fingerprint_bytes: self.config.fingerprint_bytes,
                max_log_size: self.config.max_log_size,
                encoding: self.config.encoding,
            },
            decorations: Arc::new(Decorations {
                file_path_field: self.config.file_path_field.clone(),
                file_name_field: self.config.file_name_field.clone(),
                drop_on_error: self.config.drop_on_error,
            }),
            outputs: self.outputs.take().unwrap_or_default(),
            persister,
            known,
            poll_interval: Duration::from_secs_f64(self.config.poll_interval),
            start_at_beginning: self.config.start_at == StartAt::Beginning,
            first_check: true,
        };

        let cancel = self.worker.cancellation();
        self.worker.spawn(tailer.run(cancel));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.worker.stop(&self.id, "file_input").await;
        Ok(())
    }
}

/// One tracked file plus its absence counter for eviction
struct KnownFile {
    reader: Arc<Mutex<FileReader>>,
    unseen_polls: u32,
}

impl KnownFile {
    fn new(reader: FileReader) -> Self {
        Self::new_seen(Arc::new(Mutex::new(reader)))
    }

    fn new_seen(reader: Arc<Mutex<FileReader>>) -> Self {
        Self {
            reader,
            unseen_polls: 0,
        }
    }
}

/// The poll-loop state. `known` is mutated only here, never from the
/// per-file read tasks; each FileReader is guarded by its own lock.
struct Tailer {
    operator_id: String,
    include: Vec<String>,
    finder: Finder,
    settings: ReadSettings,
    decorations: Arc<Decorations>,
    outputs: Outputs,
    persister: ScopedPersister,
    known: HashMap<PathBuf, KnownFile>,
    poll_interval: Duration,
    start_at_beginning: bool,
    first_check: bool,
}

impl Tailer {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.poll().await;
        }

        // Flush offsets one last time so a restart resumes exactly here
        self.sync_known_files().await;
        debug!(
            operator_id = %self.operator_id,
            operator_type = "file_input",
            "file input stopped"
        );
    }

    async fn poll(&mut self) {
        let paths = self.finder.find();

        if self.first_check && paths.is_empty() {
            warn!(
                operator_id = %self.operator_id,
                operator_type = "file_input",
                include = ?self.include,
                "no files match the configured include patterns"
            );
        }

        // Unknown paths first: a renamed file must reclaim its reader
        // before the file now sitting at the old path is read
        for path in &paths {
            if !self.known.contains_key(path) {
                self.setup_reader(path.clone()).await;
            }
        }

        // Read every matched file to its end; the reads run concurrently
        // and each advances its reader's offset as entries are accepted
        // downstream
        let reads = paths
            .iter()
            .filter_map(|p| self.known.get(p))
            .map(|kf| {
                read_to_end(
                    kf.reader.clone(),
                    self.outputs.clone(),
                    self.settings.clone(),
                    self.decorations.clone(),
                    self.operator_id.clone(),
                )
            })
            .collect::<Vec<_>>();
        futures::future::join_all(reads).await;

        let matched: HashSet<&PathBuf> = paths.iter().collect();
        for (path, kf) in self.known.iter_mut() {
            if matched.contains(path) {
                kf.unseen_polls = 0;
            } else {
                kf.unseen_polls += 1;
            }
        }
        self.known.retain(|path, kf| {
            if kf.unseen_polls > UNSEEN_POLL_LIMIT {
                debug!(path = %path.display(), "dropping reader for long-absent file");
                false
            } else {
                true
            }
        });

        self.sync_known_files().await;
        self.first_check = false;
    }

    /// Create a reader for a path seen for the first time. If the file's
    /// fingerprint matches a known reader, the file was renamed: the old
    /// reader is reassigned to the new path and keeps its offset.
    async fn setup_reader(&mut self, path: PathBuf) {
        let fingerprint = match File::open(&path)
            .and_then(|mut f| Fingerprint::read(&mut f, self.settings.fingerprint_bytes))
        {
            Ok(fp) => fp,
            Err(e) => {
                debug!(
                    operator_id = %self.operator_id,
                    path = %path.display(),
                    error = %e,
                    "failed to fingerprint new file"
                );
                return;
            }
        };

        if !fingerprint.is_empty() {
            let mut renamed_from = None;
            for (old_path, kf) in &self.known {
                let reader = kf.reader.lock().await;
                if fingerprint.matches(reader.fingerprint()) {
                    renamed_from = Some(old_path.clone());
                    break;
                }
            }

            if let Some(old_path) = renamed_from {
                if let Some(kf) = self.known.remove(&old_path) {
                    kf.reader.lock().await.set_path(path.clone());
                    debug!(
                        operator_id = %self.operator_id,
                        from = %old_path.display(),
                        to = %path.display(),
                        "file renamed, reassigning reader"
                    );
                    self.known.insert(path, KnownFile::new_seen(kf.reader));
                    return;
                }
            }
        }

        let start_at_end = self.first_check && !self.start_at_beginning;
        match FileReader::create(path.clone(), self.settings.fingerprint_bytes, start_at_end) {
            Ok(reader) => {
                debug!(
                    operator_id = %self.operator_id,
                    path = %path.display(),
                    start_at_end,
                    "tracking new file"
                );
                self.known.insert(path, KnownFile::new(reader));
            }
            Err(e) => {
                debug!(
                    operator_id = %self.operator_id,
                    path = %path.display(),
                    error = %e,
                    "failed to open new file"
                );
            }
        }
    }

    async fn sync_known_files(&mut self) {
        let mut records = Vec::with_capacity(self.known.len());
        for kf in self.known.values() {
            records.push(kf.reader.lock().await.record());
        }

        match encode_known_files(&records) {
            Ok(bytes) => {
                self.persister.set(KNOWN_FILES_KEY, bytes);
                if let Err(e) = self.persister.sync() {
                    error!(
                        operator_id = %self.operator_id,
                        operator_type = "file_input",
                        error = %e,
                        "failed to persist offsets"
                    );
                }
            }
            Err(e) => {
                error!(
                    operator_id = %self.operator_id,
                    operator_type = "file_input",
                    error = %e,
                    "failed to encode known files"
                );
            }
        }
    }
}

/// Read one file to its end, emitting an entry per record. The reader's
/// offset is advanced only after an entry has been accepted by the
/// downstream queue. Read errors are transient: they are logged and the
/// reader stays known for the next tick.
async fn read_to_end(
    reader: Arc<Mutex<FileReader>>,
    outputs: Outputs,
    settings: ReadSettings,
    decorations: Arc<Decorations>,
    operator_id: String,
) {
    let mut reader = reader.lock().await;

    let records = match reader.read_records(&settings) {
        Ok(records) => records,
        Err(e) => {
            debug!(
                operator_id = %operator_id,
                operator_type = "file_input",
                path = %reader.path().display(),
                error = %e,
                "failed to read file, will retry on the next poll"
            );
            return;
        }
    };

    for record in records {
        let end_offset = record.end_offset;

        let mut entry = match record.body {
            Body::Text(text) => Entry::with_record(json!({ "message": text })),
            Body::Undecodable { error, raw } => {
                if decorations.drop_on_error {
                    reader.set_offset(end_offset);
                    continue;
                }
                Entry::with_record(json!({ "error": error, "raw": raw }))
            }
        };

        if record.truncated {
            entry.add_label("truncated", "true");
        }
        decorate(&mut entry, &reader, &decorations, &operator_id);

        if outputs.send(entry).await.is_err() {
            debug!(
                operator_id = %operator_id,
                operator_type = "file_input",
                path = %reader.path().display(),
                "downstream closed, stopping read"
            );
            return;
        }
        reader.set_offset(end_offset);
    }
}

fn decorate(entry: &mut Entry, reader: &FileReader, decorations: &Decorations, operator_id: &str) {
    if let Some(field) = &decorations.file_path_field {
        let path = reader.path().display().to_string();
        if let Err(e) = field.set(entry, json!(path)) {
            warn!(operator_id, operator_type = "file_input", error = %e, "failed to set file path field");
        }
    }
    if let Some(field) = &decorations.file_name_field {
        let name = reader
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Err(e) = field.set(entry, json!(name)) {
            warn!(operator_id, operator_type = "file_input", error = %e, "failed to set file name field");
        }
    }
}

/// Encode known readers as a count followed by one document per reader
fn encode_known_files(records: &[ReaderRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    serde_json::to_writer(&mut buf, &records.len())?;
    buf.push(b'\n');
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn decode_known_files(bytes: &[u8]) -> Result<Vec<ReaderRecord>> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<serde_json::Value>();

    let count = match stream.next() {
        None => return Ok(Vec::new()),
        Some(value) => value?
            .as_u64()
            .ok_or_else(|| Error::Persistence("known files document must begin with a count".to_string()))?
            as usize,
    };

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let value = stream
            .next()
            .ok_or_else(|| Error::Persistence("known files document ended early".to_string()))??;
        records.push(serde_json::from_value(value)?);
    }
    Ok(records)
}

fn load_known_files(persister: &ScopedPersister) -> Result<HashMap<PathBuf, KnownFile>> {
    let Some(bytes) = persister.get(KNOWN_FILES_KEY) else {
        return Ok(HashMap::new());
    };

    let mut known = HashMap::new();
    for record in decode_known_files(&bytes)? {
        let path = record.path.clone();
        known.insert(path, KnownFile::new(FileReader::from_record(record)));
    }
    Ok(known)
}
