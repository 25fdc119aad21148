// Copyright 2024-2025 Joblet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-job output fan-out. One pump per job owns the child's pipes and is
//! the only writer of that job's event sequence; subscribers replay from
//! the ring (and the on-disk segments once the ring has evicted) and then
//! follow live events. Slow subscribers are dropped, never waited for.

use crate::config::LogBusConfig;
use crate::service::persist::PersistenceClient;
use bytes::Bytes;
use chrono::Utc;
use joblet_common::error::JobletError;
use joblet_common::model::{JobId, LogEvent, LogStream};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a subscriber receives. `Lagged` is terminal: the subscriber fell
/// more than half the ring behind and was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionItem {
    Event(LogEvent),
    Lagged,
}

pub struct LogSubscription {
    receiver: mpsc::Receiver<SubscriptionItem>,
}

impl LogSubscription {
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        self.receiver.recv().await
    }
}

struct ChannelState {
    ring: VecDeque<LogEvent>,
    ring_bytes: usize,
    next_seq: u64,
    secrets: Vec<String>,
    log_dir: PathBuf,
    segment_index: u64,
    segment_written: u64,
    segment_file: Option<tokio::fs::File>,
}

struct JobLogChannel {
    job_id: JobId,
    state: Mutex<ChannelState>,
    live: broadcast::Sender<LogEvent>,
    /// `Some(end)` once the job is terminal; `end` is the exclusive upper
    /// bound of the sequence space.
    end_seq: watch::Sender<Option<u64>>,
}

pub struct LogBus {
    config: LogBusConfig,
    persistence: Arc<dyn PersistenceClient>,
    channels: RwLock<HashMap<JobId, Arc<JobLogChannel>>>,
}

impl LogBus {
    pub fn new(config: LogBusConfig, persistence: Arc<dyn PersistenceClient>) -> Self {
        Self {
            config,
            persistence,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the per-job channel. Must happen before launch so that the
    /// "started" system event and the first output chunk cannot race the
    /// channel's existence.
    pub async fn register(&self, job_id: JobId, log_dir: PathBuf, secrets: Vec<String>) {
        let channel = Arc::new(JobLogChannel {
            job_id,
            state: Mutex::new(ChannelState {
                ring: VecDeque::new(),
                ring_bytes: 0,
                next_seq: 0,
                secrets,
                log_dir,
                segment_index: 0,
                segment_written: 0,
                segment_file: None,
            }),
            live: broadcast::channel(self.config.ring_max_events / 2).0,
            end_seq: watch::channel(None).0,
        });
        self.channels.write().await.insert(job_id, channel);
    }

    /// Re-register a terminal job whose events only exist on disk (after
    /// a server restart). Replays work; no live events will follow.
    pub async fn ensure_historic(&self, job_id: JobId, log_dir: PathBuf) {
        let mut channels = self.channels.write().await;
        if channels.contains_key(&job_id) {
            return;
        }
        let end = read_segment_events(&log_dir, 0)
            .await
            .map(|events| events.last().map(|event| event.seq + 1).unwrap_or(0))
            .unwrap_or(0);
        let channel = Arc::new(JobLogChannel {
            job_id,
            state: Mutex::new(ChannelState {
                ring: VecDeque::new(),
                ring_bytes: 0,
                next_seq: end,
                secrets: Vec::new(),
                log_dir,
                segment_index: 0,
                segment_written: 0,
                segment_file: None,
            }),
            live: broadcast::channel(16).0,
            end_seq: watch::channel(Some(end)).0,
        });
        channels.insert(job_id, channel);
    }

    pub async fn remove(&self, job_id: &JobId) {
        self.channels.write().await.remove(job_id);
    }

    async fn channel(&self, job_id: &JobId) -> Result<Arc<JobLogChannel>, JobletError> {
        self.channels
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobletError::not_found(format!("No log channel for job {job_id}")))
    }

    /// Append one chunk to the job's event sequence.
    pub async fn publish(
        &self,
        job_id: &JobId,
        stream: LogStream,
        payload: Bytes,
    ) -> Result<LogEvent, JobletError> {
        let channel = self.channel(job_id).await?;
        let event = channel
            .append(payload, stream, &self.config)
            .await?;
        // Mirroring to the persistence subprocess is best-effort for logs.
        if let Err(err) = self.persistence.append_log(&event).await {
            debug!(job_id = %job_id, "Dropped log mirror: {err}");
        }
        Ok(event)
    }

    pub async fn publish_system(
        &self,
        job_id: &JobId,
        message: impl Into<String>,
    ) -> Result<(), JobletError> {
        let message = message.into();
        self.publish(job_id, LogStream::System, Bytes::from(message))
            .await?;
        Ok(())
    }

    /// Close the sequence. Subscribers finish once they have delivered
    /// everything below the end marker.
    pub async fn finish(&self, job_id: &JobId) {
        if let Ok(channel) = self.channel(job_id).await {
            let state = channel.state.lock().await;
            let _ = channel.end_seq.send(Some(state.next_seq));
        }
    }

    /// Start the stdout/stderr readers for a launched child. The returned
    /// handle completes when both pipes reached EOF.
    pub fn spawn_pump(
        self: Arc<Self>,
        job_id: JobId,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: impl AsyncRead + Unpin + Send + 'static,
    ) -> JoinHandle<()> {
        let chunk = self.config.chunk_bytes;
        let bus_out = Arc::clone(&self);
        let bus_err = self;
        let out = tokio::spawn(async move {
            pump_stream(bus_out, job_id, LogStream::Stdout, stdout, chunk).await;
        });
        let err = tokio::spawn(async move {
            pump_stream(bus_err, job_id, LogStream::Stderr, stderr, chunk).await;
        });
        tokio::spawn(async move {
            let _ = out.await;
            let _ = err.await;
        })
    }

    /// Replay everything with `seq >= from_seq` then follow live output.
    /// The stream ends after the job is terminal and fully delivered.
    pub async fn subscribe(
        &self,
        job_id: &JobId,
        from_seq: u64,
    ) -> Result<LogSubscription, JobletError> {
        let channel = self.channel(job_id).await?;
        let (tx, rx) = mpsc::channel(64);

        // Snapshot under the state lock so the broadcast subscription is
        // in place before any later event can be published.
        let (ring_snapshot, ring_first, log_dir, mut live, mut end_seq) = {
            let state = channel.state.lock().await;
            let ring_first = state
                .ring
                .front()
                .map(|event| event.seq)
                .unwrap_or(state.next_seq);
            let snapshot: Vec<LogEvent> = state
                .ring
                .iter()
                .filter(|event| event.seq >= from_seq)
                .cloned()
                .collect();
            (
                snapshot,
                ring_first,
                state.log_dir.clone(),
                channel.live.subscribe(),
                channel.end_seq.subscribe(),
            )
        };

        tokio::spawn(async move {
            // `delivered` is the next sequence number the subscriber expects.
            let mut delivered = from_seq;

            if from_seq < ring_first {
                match read_segment_events(&log_dir, from_seq).await {
                    Ok(historic) => {
                        for event in historic {
                            if event.seq >= ring_first {
                                break;
                            }
                            if event.seq >= delivered {
                                delivered = event.seq + 1;
                                if tx.send(SubscriptionItem::Event(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("Historic log replay failed: {err}");
                    }
                }
            }

            for event in ring_snapshot {
                if event.seq >= delivered {
                    delivered = event.seq + 1;
                    if tx.send(SubscriptionItem::Event(event)).await.is_err() {
                        return;
                    }
                }
            }

            loop {
                if let Some(end) = *end_seq.borrow() {
                    if delivered >= end {
                        return;
                    }
                }
                tokio::select! {
                    result = live.recv() => match result {
                        Ok(event) => {
                            if event.seq >= delivered {
                                delivered = event.seq + 1;
                                if tx.send(SubscriptionItem::Event(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Log subscriber lagged by {skipped} events, dropping");
                            let _ = tx.send(SubscriptionItem::Lagged).await;
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return;
                        }
                    },
                    _ = end_seq.changed() => {}
                }
            }
        });

        Ok(LogSubscription { receiver: rx })
    }
}

impl JobLogChannel {
    async fn append(
        &self,
        payload: Bytes,
        stream: LogStream,
        config: &LogBusConfig,
    ) -> Result<LogEvent, JobletError> {
        let mut state = self.state.lock().await;

        let payload = redact(payload, &state.secrets);
        let event = LogEvent {
            job_id: self.job_id,
            seq: state.next_seq,
            stream,
            payload,
            timestamp: Utc::now(),
        };
        state.next_seq += 1;

        state.ring_bytes += event.len();
        state.ring.push_back(event.clone());
        while state.ring.len() > config.ring_max_events
            || state.ring_bytes > config.ring_max_bytes
        {
            if let Some(evicted) = state.ring.pop_front() {
                state.ring_bytes -= evicted.len();
            } else {
                break;
            }
        }

        if let Err(err) = spill(&mut state, &event, config).await {
            warn!(job_id = %self.job_id, "Log segment write failed: {err}");
        }

        // Broadcast inside the lock: sequence order on the live channel
        // matches sequence assignment.
        let _ = self.live.send(event.clone());

        Ok(event)
    }
}

/// Replace every secret environment value with `***` before the chunk
/// leaves the pump. Works on the lossy UTF-8 view; binary chunks that do
/// not contain any secret pass through untouched.
fn redact(payload: Bytes, secrets: &[String]) -> Bytes {
    if secrets.is_empty() {
        return payload;
    }
    let text = String::from_utf8_lossy(&payload);
    let mut redacted = text.to_string();
    let mut changed = false;
    for secret in secrets {
        if !secret.is_empty() && redacted.contains(secret.as_str()) {
            redacted = redacted.replace(secret.as_str(), "***");
            changed = true;
        }
    }
    if changed {
        Bytes::from(redacted)
    } else {
        payload
    }
}

async fn spill(
    state: &mut ChannelState,
    event: &LogEvent,
    config: &LogBusConfig,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');

    if state.segment_file.is_none() || state.segment_written >= config.segment_bytes {
        if state.segment_file.is_some() {
            state.segment_index += 1;
        }
        tokio::fs::create_dir_all(&state.log_dir).await?;
        let path = state
            .log_dir
            .join(format!("{:08}.seg", state.segment_index));
        state.segment_file = Some(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?,
        );
        state.segment_written = 0;
    }

    let file = state.segment_file.as_mut().unwrap();
    file.write_all(&line).await?;
    state.segment_written += line.len() as u64;
    Ok(())
}

/// Load historic events with `seq >= from_seq` from the segment files,
/// oldest first.
async fn read_segment_events(
    log_dir: &std::path::Path,
    from_seq: u64,
) -> std::io::Result<Vec<LogEvent>> {
    let mut segments = Vec::new();
    let mut dir = match tokio::fs::read_dir(log_dir).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("seg") {
            segments.push(path);
        }
    }
    segments.sort();

    let mut events = Vec::new();
    for segment in segments {
        let contents = tokio::fs::read_to_string(&segment).await?;
        for line in contents.lines() {
            match serde_json::from_str::<LogEvent>(line) {
                Ok(event) if event.seq >= from_seq => events.push(event),
                Ok(_) => {}
                Err(err) => warn!("Skipping corrupt log segment line: {err}"),
            }
        }
    }
    events.sort_by_key(|event| event.seq);
    Ok(events)
}

async fn pump_stream(
    bus: Arc<LogBus>,
    job_id: JobId,
    stream: LogStream,
    mut source: impl AsyncRead + Unpin,
    chunk_bytes: usize,
) {
    let mut buffer = vec![0u8; chunk_bytes];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let payload = Bytes::copy_from_slice(&buffer[..n]);
                if bus.publish(&job_id, stream, payload).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(job_id = %job_id, "Pipe read ended: {err}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::service::persist::DisabledPersistence;

    fn test_bus(dir: &std::path::Path) -> (Arc<LogBus>, PathBuf) {
        let bus = Arc::new(LogBus::new(
            LogBusConfig {
                chunk_bytes: 1024,
                ring_max_bytes: 64 * 1024,
                ring_max_events: 64,
                segment_bytes: 4096,
            },
            Arc::new(DisabledPersistence),
        ));
        (bus, dir.to_path_buf())
    }

    async fn collect_all(mut subscription: LogSubscription) -> Vec<SubscriptionItem> {
        let mut items = Vec::new();
        while let Some(item) = subscription.next().await {
            items.push(item);
        }
        items
    }

    #[test]
    async fn sequences_are_contiguous_across_streams() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(job_id, log_dir, Vec::new()).await;

        bus.publish(&job_id, LogStream::Stdout, Bytes::from_static(b"a"))
            .await
            .unwrap();
        bus.publish(&job_id, LogStream::Stderr, Bytes::from_static(b"b"))
            .await
            .unwrap();
        bus.publish(&job_id, LogStream::Stdout, Bytes::from_static(b"c"))
            .await
            .unwrap();
        bus.finish(&job_id).await;

        let items = collect_all(bus.subscribe(&job_id, 0).await.unwrap()).await;
        let seqs: Vec<u64> = items
            .iter()
            .map(|item| match item {
                SubscriptionItem::Event(event) => event.seq,
                SubscriptionItem::Lagged => panic!("unexpected lag"),
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    async fn two_subscribers_see_identical_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(job_id, log_dir, Vec::new()).await;

        let sub_a = bus.subscribe(&job_id, 0).await.unwrap();
        let sub_b = bus.subscribe(&job_id, 0).await.unwrap();

        for i in 0..10u8 {
            bus.publish(&job_id, LogStream::Stdout, Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        bus.finish(&job_id).await;

        let events_a = collect_all(sub_a).await;
        let events_b = collect_all(sub_b).await;
        assert_eq!(events_a.len(), 10);
        assert_eq!(events_a, events_b);
    }

    #[test]
    async fn replay_after_completion_delivers_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(job_id, log_dir, Vec::new()).await;

        for i in 0..100u32 {
            bus.publish(
                &job_id,
                LogStream::Stdout,
                Bytes::from(format!("line {i}\n")),
            )
            .await
            .unwrap();
        }
        bus.finish(&job_id).await;

        // Subscribing only after the job finished must still see all 100.
        let items = collect_all(bus.subscribe(&job_id, 0).await.unwrap()).await;
        assert_eq!(items.len(), 100);
        match &items[99] {
            SubscriptionItem::Event(event) => {
                assert_eq!(event.seq, 99);
                assert_eq!(event.payload, Bytes::from("line 99\n"));
            }
            SubscriptionItem::Lagged => panic!("unexpected lag"),
        }
    }

    #[test]
    async fn ring_eviction_falls_back_to_disk_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(job_id, log_dir, Vec::new()).await;

        // Far beyond ring_max_events (64), forcing eviction + disk replay.
        for i in 0..200u32 {
            bus.publish(
                &job_id,
                LogStream::Stdout,
                Bytes::from(format!("{i}")),
            )
            .await
            .unwrap();
        }
        bus.finish(&job_id).await;

        let items = collect_all(bus.subscribe(&job_id, 0).await.unwrap()).await;
        assert_eq!(items.len(), 200);
        let seqs: Vec<u64> = items
            .iter()
            .map(|item| match item {
                SubscriptionItem::Event(event) => event.seq,
                SubscriptionItem::Lagged => panic!("unexpected lag"),
            })
            .collect();
        let expected: Vec<u64> = (0..200).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    async fn from_seq_skips_earlier_events() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(job_id, log_dir, Vec::new()).await;

        for i in 0..10u32 {
            bus.publish(&job_id, LogStream::Stdout, Bytes::from(format!("{i}")))
                .await
                .unwrap();
        }
        bus.finish(&job_id).await;

        let items = collect_all(bus.subscribe(&job_id, 7).await.unwrap()).await;
        assert_eq!(items.len(), 3);
    }

    #[test]
    async fn secrets_are_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(
            job_id,
            log_dir,
            vec!["hunter2".to_string()],
        )
        .await;

        bus.publish(
            &job_id,
            LogStream::Stdout,
            Bytes::from_static(b"the password is hunter2, obviously"),
        )
        .await
        .unwrap();
        bus.finish(&job_id).await;

        let items = collect_all(bus.subscribe(&job_id, 0).await.unwrap()).await;
        match &items[0] {
            SubscriptionItem::Event(event) => {
                assert_eq!(
                    event.payload,
                    Bytes::from_static(b"the password is ***, obviously")
                );
            }
            SubscriptionItem::Lagged => panic!("unexpected lag"),
        }
    }

    #[test]
    async fn subscription_ends_for_empty_terminal_job() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, log_dir) = test_bus(dir.path());
        let job_id = JobId::new_v4();
        bus.register(job_id, log_dir, Vec::new()).await;
        bus.finish(&job_id).await;

        let items = collect_all(bus.subscribe(&job_id, 0).await.unwrap()).await;
        assert!(items.is_empty());
    }
}
