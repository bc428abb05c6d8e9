use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, Scope};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::awake::KeepAwake;
use crate::backend::{
    InputFileSpec, RegisteredInputFile, RegisteredSample, SampleBackend, SampleRegistration,
};
use crate::domain::SampleStatus;
use crate::error::{UploadError, UploadErrorKind};
use crate::s3::{ObjectStore, StorageConnector};
use crate::sample::LogicalSample;
use crate::session::UploadSession;
use crate::source::RawFile;
use crate::store::SessionStore;

pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SampleUploadEvent {
    Registered {
        sample: String,
        sample_id: u64,
    },
    Started {
        sample: String,
        /// Name and size of every file the sample uploads.
        files: Vec<(String, u64)>,
    },
    FileProgress {
        sample: String,
        file: String,
        bytes_uploaded: u64,
        total_bytes: u64,
    },
    FileCompleted {
        sample: String,
        file: String,
    },
    SampleSucceeded {
        sample: String,
        sample_id: u64,
    },
    SampleFailed {
        sample: String,
        kind: UploadErrorKind,
        message: String,
    },
    BatchComplete {
        succeeded: usize,
        failed: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn event(&self, event: SampleUploadEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: SampleUploadEvent) {}
}

pub struct ChannelSink {
    tx: Sender<SampleUploadEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SampleUploadEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn event(&self, event: SampleUploadEvent) {
        // The receiver may have hung up; the upload carries on regardless.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub part_size: u64,
    pub heartbeat_interval: Duration,
    pub keep_awake: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            heartbeat_interval: Duration::from_secs(10),
            keep_awake: true,
        }
    }
}

pub struct UploadSessionManager<B, S> {
    backend: B,
    storage: S,
    options: UploadOptions,
    store: Option<SessionStore>,
}

impl<B: SampleBackend, S: StorageConnector> UploadSessionManager<B, S> {
    pub fn new(backend: B, storage: S, options: UploadOptions) -> Self {
        Self {
            backend,
            storage,
            options,
            store: None,
        }
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Registers and uploads `samples` as a new batch. Every sample must be
    /// validated and have one upload file per read direction.
    pub fn upload(
        &self,
        samples: &[LogicalSample],
        sink: &dyn EventSink,
    ) -> Result<UploadSession, UploadError> {
        check_uploadable(samples)?;
        let mut session = UploadSession::new(samples, self.options.part_size.max(MIN_PART_SIZE));
        let files = upload_files(samples);
        self.run(&mut session, files, sink);
        Ok(session)
    }

    /// Re-runs the named failed samples of `session` with the files of
    /// `samples`. Samples that already have a backend record are not
    /// registered again; preserved multipart uploads are continued.
    pub fn retry(
        &self,
        session: &mut UploadSession,
        samples: &[LogicalSample],
        sink: &dyn EventSink,
    ) -> Result<(), UploadError> {
        check_uploadable(samples)?;
        let mut files = Vec::with_capacity(samples.len());
        for sample in samples {
            let entry = session
                .sample(&sample.name)
                .ok_or_else(|| UploadError::UnknownSample(sample.name.clone()))?;
            if entry.status == SampleStatus::Success {
                debug!(sample = %sample.name, "already uploaded, skipping");
                continue;
            }
            let upload = sample.upload_files().into_iter().cloned().collect();
            files.push((sample.name.clone(), upload));
        }
        self.run(session, files, sink);
        Ok(())
    }

    /// Like [`retry`](Self::retry), reopening the files from the local paths
    /// recorded in the session.
    pub fn resume(
        &self,
        session: &mut UploadSession,
        names: &[String],
        sink: &dyn EventSink,
    ) -> Result<(), UploadError> {
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let entry = session
                .sample(name)
                .ok_or_else(|| UploadError::UnknownSample(name.clone()))?;
            if entry.status == SampleStatus::Success {
                continue;
            }
            let reopened = entry
                .files
                .iter()
                .map(|file| file.reopen())
                .collect::<Result<Vec<_>, _>>()?;
            files.push((name.clone(), reopened));
        }
        self.run(session, files, sink);
        Ok(())
    }

    pub fn spawn_upload(
        self,
        samples: Vec<LogicalSample>,
    ) -> Result<(Receiver<SampleUploadEvent>, thread::JoinHandle<UploadSession>), UploadError>
    where
        B: 'static,
        S: 'static,
    {
        check_uploadable(&samples)?;
        let (sink, rx) = ChannelSink::new();
        let handle = thread::spawn(move || {
            let mut session =
                UploadSession::new(&samples, self.options.part_size.max(MIN_PART_SIZE));
            let files = upload_files(&samples);
            self.run(&mut session, files, &sink);
            session
        });
        Ok((rx, handle))
    }

    fn run(
        &self,
        session: &mut UploadSession,
        files: Vec<(String, Vec<RawFile>)>,
        sink: &dyn EventSink,
    ) {
        info!(batch = %session.batch_id, samples = files.len(), "starting upload batch");
        let _awake = self.options.keep_awake.then(KeepAwake::acquire);
        let names = files.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
        let registered = self.ensure_registered(session, &names, sink);

        let heartbeat_ids = session
            .samples
            .iter()
            .filter(|sample| names.contains(&sample.name))
            .filter_map(|sample| sample.sample_id)
            .collect::<Vec<_>>();

        thread::scope(|scope| {
            let _heartbeat = Heartbeat::start(
                scope,
                &self.backend,
                heartbeat_ids,
                self.options.heartbeat_interval,
            );
            for (name, upload_files) in &files {
                let Some(record) = registered.iter().find(|record| &record.name == name) else {
                    continue;
                };
                self.upload_sample(session, record, upload_files, sink);
            }
        });

        let succeeded = names
            .iter()
            .filter(|name| {
                session
                    .sample(name)
                    .map(|sample| sample.status == SampleStatus::Success)
                    .unwrap_or(false)
            })
            .count();
        let failed = names.len() - succeeded;
        info!(batch = %session.batch_id, succeeded, failed, "upload batch finished");
        self.persist(session);
        sink.event(SampleUploadEvent::BatchComplete { succeeded, failed });
    }

    fn ensure_registered(
        &self,
        session: &mut UploadSession,
        names: &[String],
        sink: &dyn EventSink,
    ) -> Vec<RegisteredSample> {
        let mut records = Vec::new();
        let mut pending = Vec::new();
        for name in names {
            let Some(sample) = session.sample(name) else {
                continue;
            };
            match sample.sample_id {
                Some(id) => records.push(RegisteredSample {
                    id,
                    name: name.clone(),
                    input_files: sample
                        .files
                        .iter()
                        .filter_map(|file| {
                            Some(RegisteredInputFile {
                                name: file.name.clone(),
                                s3_bucket: file.bucket.clone()?,
                                s3_file_path: file.key.clone()?,
                            })
                        })
                        .collect(),
                }),
                None => pending.push(registration_for(session, name)),
            }
        }
        if pending.is_empty() {
            return records;
        }

        match self.backend.register_samples(&pending) {
            Ok(outcome) => {
                let reason = if outcome.errors.is_empty() {
                    "sample was not created".to_string()
                } else {
                    outcome.errors.join("; ")
                };
                for registration in &pending {
                    let created = outcome
                        .samples
                        .iter()
                        .find(|record| record.name == registration.name)
                        .filter(|_| !outcome.errored_sample_names.contains(&registration.name));
                    match created {
                        Some(record) => {
                            apply_registration(session, record);
                            sink.event(SampleUploadEvent::Registered {
                                sample: record.name.clone(),
                                sample_id: record.id,
                            });
                            records.push(record.clone());
                        }
                        None => {
                            let err = UploadError::Registration(reason.clone());
                            self.fail(session, &registration.name, &err, sink);
                        }
                    }
                }
            }
            Err(err) => {
                let err = match err {
                    UploadError::Registration(_) => err,
                    other => UploadError::Registration(other.to_string()),
                };
                for registration in &pending {
                    self.fail(session, &registration.name, &err, sink);
                }
            }
        }
        self.persist(session);
        records
    }

    fn upload_sample(
        &self,
        session: &mut UploadSession,
        record: &RegisteredSample,
        files: &[RawFile],
        sink: &dyn EventSink,
    ) {
        let name = record.name.as_str();
        session.mark_status(name, SampleStatus::Uploading);
        sink.event(SampleUploadEvent::Started {
            sample: name.to_string(),
            files: files
                .iter()
                .map(|file| (file.name().to_string(), file.len()))
                .collect(),
        });

        let result = self.transfer_sample(session, record, files, sink);
        let result = result.and_then(|()| self.backend.complete_sample_upload(record.id));
        match result {
            Ok(()) => {
                session.mark_status(name, SampleStatus::Success);
                info!(sample = name, sample_id = record.id, "sample uploaded");
                self.persist(session);
                sink.event(SampleUploadEvent::SampleSucceeded {
                    sample: name.to_string(),
                    sample_id: record.id,
                });
            }
            Err(err) => self.fail(session, name, &err, sink),
        }
    }

    fn transfer_sample(
        &self,
        session: &mut UploadSession,
        record: &RegisteredSample,
        files: &[RawFile],
        sink: &dyn EventSink,
    ) -> Result<(), UploadError> {
        let credentials = self.backend.upload_credentials(record.id).map_err(|err| match err {
            UploadError::Credential(_) => err,
            other => UploadError::Credential(other.to_string()),
        })?;
        let store = self.storage.connect(&credentials)?;

        let mut targets = Vec::with_capacity(files.len());
        for file in files {
            let location = record.input_file(file.name()).ok_or_else(|| {
                UploadError::Transfer(format!("no upload location for {}", file.name()))
            })?;
            targets.push(FileTarget {
                sample: &record.name,
                file,
                bucket: &location.s3_bucket,
                key: &location.s3_file_path,
            });
        }

        let state = Mutex::new(session);
        let results = thread::scope(|scope| {
            let handles = targets
                .iter()
                .map(|target| {
                    let state = &state;
                    let store = store.as_ref();
                    scope.spawn(move || self.transfer_file(store, state, target, sink))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(UploadError::Transfer("upload thread panicked".to_string())))
                })
                .collect::<Vec<_>>()
        });
        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }

    fn transfer_file(
        &self,
        store: &dyn ObjectStore,
        state: &Mutex<&mut UploadSession>,
        target: &FileTarget<'_>,
        sink: &dyn EventSink,
    ) -> Result<(), UploadError> {
        let FileTarget {
            sample,
            file,
            bucket,
            key,
        } = *target;
        let total = file.len();

        let (done, part_size) = {
            let session = lock(state);
            if session.completed_files.contains(key) {
                debug!(sample, key, "file already uploaded");
                return Ok(());
            }
            (session.multipart.get(key).cloned(), session.part_size)
        };

        let upload_id = match &done {
            Some(state) => {
                info!(sample, key, parts = state.parts.len(), "resuming multipart upload");
                state.upload_id.clone()
            }
            None => {
                let id = store.create_multipart(bucket, key)?;
                let mut session = lock(state);
                session.record_multipart(key, &id);
                self.persist(&session);
                id
            }
        };

        let done = done.unwrap_or_default();
        let part_count = total.div_ceil(part_size).max(1);
        let mut uploaded = done
            .parts
            .iter()
            .map(|part| part_len(part.part_number, part_size, total))
            .sum::<u64>();
        sink.event(SampleUploadEvent::FileProgress {
            sample: sample.to_string(),
            file: file.name().to_string(),
            bytes_uploaded: uploaded,
            total_bytes: total,
        });

        for number in 1..=part_count {
            let number = u32::try_from(number)
                .map_err(|_| UploadError::Transfer(format!("{} has too many parts", file.name())))?;
            if done.has_part(number) {
                continue;
            }
            let start = u64::from(number - 1) * part_size;
            let end = (start + part_size).min(total);
            let body = file.read_range(start, end)?;
            let part = store.upload_part(bucket, key, &upload_id, number, &body)?;
            uploaded += body.len() as u64;
            {
                let mut session = lock(state);
                session.record_part(key, part);
                session.set_bytes_uploaded(sample, file.name(), uploaded);
                self.persist(&session);
            }
            sink.event(SampleUploadEvent::FileProgress {
                sample: sample.to_string(),
                file: file.name().to_string(),
                bytes_uploaded: uploaded,
                total_bytes: total,
            });
        }

        let parts = lock(state)
            .multipart
            .get(key)
            .map(|state| state.parts.clone())
            .unwrap_or_default();
        store.complete_multipart(bucket, key, &upload_id, &parts)?;
        {
            let mut session = lock(state);
            session.record_file_complete(key);
            session.set_bytes_uploaded(sample, file.name(), total);
            self.persist(&session);
        }
        sink.event(SampleUploadEvent::FileCompleted {
            sample: sample.to_string(),
            file: file.name().to_string(),
        });
        Ok(())
    }

    fn fail(&self, session: &mut UploadSession, name: &str, err: &UploadError, sink: &dyn EventSink) {
        warn!(sample = name, error = %err, "sample upload failed");
        session.mark_failed(name, err);
        self.persist(session);
        sink.event(SampleUploadEvent::SampleFailed {
            sample: name.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn persist(&self, session: &UploadSession) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(session) {
                warn!(batch = %session.batch_id, error = %err, "could not save upload session");
            }
        }
    }
}

fn check_uploadable(samples: &[LogicalSample]) -> Result<(), UploadError> {
    for sample in samples {
        if let Some(group) = sample
            .groups()
            .into_iter()
            .find(|group| group.upload_file().is_none())
        {
            return Err(UploadError::GroupingAmbiguity(format!(
                "{} has no single file to upload for {}",
                sample.name,
                group.member_names().join(", ")
            )));
        }
        if !sample.is_selectable() {
            return Err(UploadError::NotUploadable {
                name: sample.name.clone(),
                status: sample.status,
            });
        }
    }
    Ok(())
}

fn upload_files(samples: &[LogicalSample]) -> Vec<(String, Vec<RawFile>)> {
    samples
        .iter()
        .map(|sample| {
            let files = sample.upload_files().into_iter().cloned().collect();
            (sample.name.clone(), files)
        })
        .collect()
}

#[derive(Clone, Copy)]
struct FileTarget<'a> {
    sample: &'a str,
    file: &'a RawFile,
    bucket: &'a str,
    key: &'a str,
}

fn lock<'a, 'b>(
    state: &'a Mutex<&'b mut UploadSession>,
) -> std::sync::MutexGuard<'a, &'b mut UploadSession> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn part_len(part_number: u32, part_size: u64, total: u64) -> u64 {
    let start = u64::from(part_number.saturating_sub(1)) * part_size;
    total.saturating_sub(start).min(part_size)
}

fn registration_for(session: &UploadSession, name: &str) -> SampleRegistration {
    let sample = session.sample(name);
    SampleRegistration {
        name: name.to_string(),
        project_id: sample.and_then(|sample| sample.project_id),
        host_genome_name: sample.and_then(|sample| sample.host_genome.clone()),
        input_files_attributes: sample
            .map(|sample| sample.files.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|file| InputFileSpec {
                name: file.name.clone(),
                source: file.name.clone(),
                source_type: "local".to_string(),
                parts: file.parts.clone(),
            })
            .collect(),
    }
}

fn apply_registration(session: &mut UploadSession, record: &RegisteredSample) {
    if let Some(sample) = session.sample_mut(&record.name) {
        sample.sample_id = Some(record.id);
        for file in &mut sample.files {
            if let Some(location) = record.input_file(&file.name) {
                file.bucket = Some(location.s3_bucket.clone());
                file.key = Some(location.s3_file_path.clone());
            }
        }
    }
}

/// Periodic liveness ping, stopped when dropped.
struct Heartbeat {
    _stop: Sender<()>,
}

impl Heartbeat {
    fn start<'scope, B: SampleBackend>(
        scope: &'scope Scope<'scope, '_>,
        backend: &'scope B,
        sample_ids: Vec<u64>,
        interval: Duration,
    ) -> Self {
        let (stop, rx) = mpsc::channel::<()>();
        scope.spawn(move || {
            if sample_ids.is_empty() {
                return;
            }
            loop {
                if let Err(err) = backend.heartbeat(&sample_ids) {
                    warn!(error = %err, "upload heartbeat failed");
                }
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("heartbeat stopped");
        });
        Self { _stop: stop }
    }
}
