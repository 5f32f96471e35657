//! File-backed audit store.
//!
//! Events live in append-only segment files named after the first sequence
//! id they hold (`segment-00000000000000000001.log`), one JSON event per
//! line. With a sealer configured every line is sealed and base64 encoded.
//! Segments rotate after `max_events` events; range reads skip every segment
//! whose successor starts at or below the requested id.

use super::{AuditStore, StoreError};
use crate::models::AuditEvent;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use custodian_core::utils::Sealer;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

#[derive(Debug, Clone)]
struct SegmentInfo {
    first_seq: u64,
    path: PathBuf,
}

struct ActiveSegment {
    file: File,
    count: usize,
}

struct SegmentState {
    segments: Vec<SegmentInfo>,
    active: Option<ActiveSegment>,
    last_written: u64,
}

pub struct SegmentAuditStore {
    dir: PathBuf,
    max_events: usize,
    sealer: Option<Sealer>,
    state: Mutex<SegmentState>,
}

impl SegmentAuditStore {
    /// Open (or create) a segment directory and resume from its last event.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_events: usize,
        sealer: Option<Sealer>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut segments = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(first_seq) = parse_segment_name(&path) {
                segments.push(SegmentInfo { first_seq, path });
            }
        }
        segments.sort_by_key(|s| s.first_seq);

        let store = Self {
            dir,
            max_events: max_events.max(1),
            sealer,
            state: Mutex::new(SegmentState {
                segments: Vec::new(),
                active: None,
                last_written: 0,
            }),
        };

        let mut active = None;
        let mut last_written = 0;
        if let Some(last) = segments.last() {
            repair_tail(&last.path)?;
            let events = store.read_segment(&last.path)?;
            last_written = match store.last_line(&last.path)? {
                Some(line) => store
                    .decode(&line)
                    .map_err(|e| {
                        StoreError::Corrupt(format!(
                            "last event of {} does not decode with the configured sealer: {}",
                            last.path.display(),
                            e
                        ))
                    })?
                    .sequence_id,
                None => last.first_seq.saturating_sub(1),
            };
            let file = OpenOptions::new().append(true).open(&last.path)?;
            active = Some(ActiveSegment {
                file,
                count: events.len(),
            });
        }

        tracing::info!(
            dir = %store.dir.display(),
            segments = segments.len(),
            last_sequence = last_written,
            encrypted = store.sealer.is_some(),
            "Opened audit segment store"
        );

        {
            let mut state = store.state.lock();
            state.segments = segments;
            state.active = active;
            state.last_written = last_written;
        }

        Ok(store)
    }

    #[cfg(test)]
    fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    fn segment_path(&self, first_seq: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:020}{}", SEGMENT_PREFIX, first_seq, SEGMENT_SUFFIX))
    }

    fn encode(&self, event: &AuditEvent) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(event)?;
        let mut line = match &self.sealer {
            Some(sealer) => general_purpose::STANDARD
                .encode(sealer.seal(&json)?)
                .into_bytes(),
            None => json,
        };
        line.push(b'\n');
        Ok(line)
    }

    fn decode(&self, line: &str) -> Result<AuditEvent, StoreError> {
        match &self.sealer {
            Some(sealer) => {
                let sealed = general_purpose::STANDARD
                    .decode(line)
                    .map_err(|e| StoreError::Corrupt(format!("Invalid base64 line: {}", e)))?;
                Ok(serde_json::from_slice(&sealer.open(&sealed)?)?)
            }
            None => Ok(serde_json::from_str(line)?),
        }
    }

    /// Decode every complete line of a segment.
    ///
    /// A trailing line that does not decode is an append still in flight (or
    /// torn by a crash) and is ignored. Undecodable lines elsewhere are
    /// reported and skipped.
    fn read_segment(&self, path: &Path) -> Result<Vec<AuditEvent>, StoreError> {
        let content = fs::read_to_string(path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());

        for (idx, line) in lines.iter().enumerate() {
            match self.decode(line) {
                Ok(event) => events.push(event),
                Err(e) if idx + 1 == lines.len() => {
                    tracing::debug!(path = %path.display(), error = %e, "Ignoring incomplete trailing audit line");
                }
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %e,
                        "Skipping corrupt audit line"
                    );
                }
            }
        }

        Ok(events)
    }

    /// Last complete line of a segment whose torn tail was already cut.
    fn last_line(&self, path: &Path) -> Result<Option<String>, StoreError> {
        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(str::to_string))
    }

    fn write_batch(active: &mut ActiveSegment, buf: &[u8]) -> Result<(), StoreError> {
        let len_before = active.file.metadata()?.len();
        let written = active
            .file
            .write_all(buf)
            .and_then(|_| active.file.sync_data());
        if let Err(e) = written {
            // Drop the torn tail so a retried append starts on a clean line.
            if let Err(truncate_err) = active.file.set_len(len_before) {
                tracing::error!(error = %truncate_err, "Failed to truncate torn audit segment");
            }
            return Err(StoreError::Unavailable(e.to_string()));
        }
        Ok(())
    }
}

/// Cut a torn trailing line left by a crash so the next append starts clean.
fn repair_tail(path: &Path) -> Result<(), StoreError> {
    let content = fs::read(path)?;
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    tracing::warn!(
        path = %path.display(),
        discarded_bytes = content.len() - keep,
        "Truncating torn audit segment tail"
    );
    OpenOptions::new().write(true).open(path)?.set_len(keep as u64)?;
    Ok(())
}

fn parse_segment_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

impl AuditStore for SegmentAuditStore {
    fn append(&self, events: &[AuditEvent]) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = state.last_written;
        let mut buf = Vec::new();
        let mut buffered = 0usize;
        let mut buffered_last = start;

        for event in events.iter().filter(|e| e.sequence_id > start) {
            let needs_rotation = match &state.active {
                Some(active) => active.count + buffered >= self.max_events,
                None => true,
            };

            if needs_rotation {
                if let Some(active) = state.active.as_mut() {
                    if !buf.is_empty() {
                        Self::write_batch(active, &buf)?;
                        active.count += buffered;
                        state.last_written = buffered_last;
                        buf.clear();
                        buffered = 0;
                    }
                }

                let path = self.segment_path(event.sequence_id);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                tracing::debug!(path = %path.display(), "Rotated audit segment");
                state.segments.push(SegmentInfo {
                    first_seq: event.sequence_id,
                    path,
                });
                state.active = Some(ActiveSegment { file, count: 0 });
            }

            buf.extend_from_slice(&self.encode(event)?);
            buffered += 1;
            buffered_last = event.sequence_id;
        }

        if !buf.is_empty() {
            if let Some(active) = state.active.as_mut() {
                Self::write_batch(active, &buf)?;
                active.count += buffered;
                state.last_written = buffered_last;
            }
        }

        Ok(())
    }

    fn read_from(&self, from: u64, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        // Readers work from a copy of the segment list so appends never wait on them.
        let segments = self.state.lock().segments.clone();
        let mut out = Vec::new();

        for (idx, segment) in segments.iter().enumerate() {
            if let Some(next) = segments.get(idx + 1) {
                if next.first_seq <= from {
                    continue;
                }
            }

            let events = match self.read_segment(&segment.path) {
                Ok(events) => events,
                // Purged between listing and reading.
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            for event in events.into_iter().filter(|e| e.sequence_id >= from) {
                out.push(event);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }

        Ok(out)
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().last_written)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let segments = self.state.lock().segments.clone();
        let mut doomed = Vec::new();
        let mut removed = 0;

        // Whole segments only, oldest first; the active segment is never purged.
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            let events = self.read_segment(&segment.path)?;
            let newest = events.iter().map(|e| e.timestamp).max();
            match newest {
                Some(ts) if ts >= cutoff => break,
                _ => {
                    removed += events.len();
                    doomed.push(segment.path.clone());
                }
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }

        {
            let mut state = self.state.lock();
            state.segments.retain(|s| !doomed.contains(&s.path));
        }

        for path in &doomed {
            fs::remove_file(path)?;
            tracing::info!(path = %path.display(), "Purged audit segment");
        }

        Ok(removed)
    }

    fn sync(&self) -> Result<(), StoreError> {
        let state = self.state.lock();
        if let Some(active) = &state.active {
            active.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditCategory, AuditEntry, AuditOutcome};
    use custodian_core::utils::MasterKey;

    fn event(seq: u64) -> AuditEvent {
        AuditEntry::new(AuditCategory::Authorization, "check", "u1", AuditOutcome::Success)
            .detail("n", seq)
            .into_event(seq)
    }

    #[test]
    fn test_segments_rotate_and_reads_span_them() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentAuditStore::open(dir.path(), 3, None).unwrap();

        let events: Vec<AuditEvent> = (1..=8).map(event).collect();
        store.append(&events).unwrap();

        assert_eq!(store.segment_count(), 3);
        assert!(dir.path().join("segment-00000000000000000004.log").exists());

        let ids: Vec<u64> = store.read_from(3, 4).unwrap().iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
        assert_eq!(store.last_sequence().unwrap(), 8);
    }

    #[test]
    fn test_reopen_resumes_sequence_and_active_segment() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SegmentAuditStore::open(dir.path(), 10, None).unwrap();
            store.append(&[event(1), event(2)]).unwrap();
        }

        let store = SegmentAuditStore::open(dir.path(), 10, None).unwrap();
        assert_eq!(store.last_sequence().unwrap(), 2);
        store.append(&[event(2), event(3)]).unwrap();

        let all = store.read_from(0, 100).unwrap();
        let ids: Vec<u64> = all.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.segment_count(), 1);
    }

    #[test]
    fn test_torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SegmentAuditStore::open(dir.path(), 10, None).unwrap();
            store.append(&[event(1)]).unwrap();
        }
        let path = dir.path().join("segment-00000000000000000001.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence_id\":2,\"timest").unwrap();

        let store = SegmentAuditStore::open(dir.path(), 10, None).unwrap();
        assert_eq!(store.last_sequence().unwrap(), 1);
        store.append(&[event(2)]).unwrap();

        let ids: Vec<u64> = store.read_from(0, 10).unwrap().iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_sealed_lines_are_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let key = MasterKey::from_bytes([3u8; 32]);
        let store = SegmentAuditStore::open(dir.path(), 10, Some(Sealer::new(&key))).unwrap();
        store.append(&[event(1)]).unwrap();

        let raw = fs::read_to_string(dir.path().join("segment-00000000000000000001.log")).unwrap();
        assert!(!raw.contains("AUTHORIZATION"));

        let read = store.read_from(1, 1).unwrap();
        assert_eq!(read[0].action, "check");

    }

    #[test]
    fn test_open_with_wrong_key_or_setting_fails() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sealer = Sealer::new(&MasterKey::from_bytes([3u8; 32]));
            let store = SegmentAuditStore::open(dir.path(), 10, Some(sealer)).unwrap();
            store.append(&[event(1), event(2), event(3)]).unwrap();
        }

        let wrong_key = Sealer::new(&MasterKey::from_bytes([4u8; 32]));
        assert!(matches!(
            SegmentAuditStore::open(dir.path(), 10, Some(wrong_key)),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            SegmentAuditStore::open(dir.path(), 10, None),
            Err(StoreError::Corrupt(_))
        ));

        // The trail is untouched and still resumes with the right key.
        let sealer = Sealer::new(&MasterKey::from_bytes([3u8; 32]));
        let store = SegmentAuditStore::open(dir.path(), 10, Some(sealer)).unwrap();
        assert_eq!(store.last_sequence().unwrap(), 3);
    }

    #[test]
    fn test_purge_removes_only_old_closed_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentAuditStore::open(dir.path(), 2, None).unwrap();
        store.append(&(1..=5).map(event).collect::<Vec<_>>()).unwrap();
        assert_eq!(store.segment_count(), 3);

        let removed = store
            .purge_before(Utc::now() + chrono::Duration::seconds(60))
            .unwrap();
        assert_eq!(removed, 4);
        assert_eq!(store.segment_count(), 1);

        let ids: Vec<u64> = store.read_from(0, 10).unwrap().iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![5]);

        // Nothing older than the epoch.
        assert_eq!(store.purge_before(DateTime::<Utc>::UNIX_EPOCH).unwrap(), 0);
    }
}
