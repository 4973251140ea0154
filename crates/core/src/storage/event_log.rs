use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Events buffered per run before a flush is forced
const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL (JSON Lines) files
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Unflushed events, keyed by run; flushed on terminal events or when large
    buffers: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffers: RwLock::new(HashMap::new()),
        })
    }

    /// Get the path to the event log file for a specific run
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Flush one run's buffered events to disk
    pub async fn flush(&self, run_id: &RunId) -> Result<()> {
        let events = match self.buffers.write().await.remove(run_id) {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(()),
        };

        // Group events by the day they happened on
        let mut events_by_date: HashMap<NaiveDate, Vec<Event>> = HashMap::new();
        for event in events {
            events_by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(run_id, date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// Flush every buffered run, e.g. on shutdown
    pub async fn flush_all(&self) -> Result<()> {
        let run_ids: Vec<RunId> = self.buffers.read().await.keys().cloned().collect();
        for run_id in run_ids {
            self.flush(&run_id).await?;
        }
        Ok(())
    }

    /// Get all event log files for a run
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();

        // Walk through year/month/day directories
        for year in subdirectories(&events_dir)? {
            for month in subdirectories(&year)? {
                for day in subdirectories(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id.clone();
        let terminal = event.event_type.is_terminal();

        let buffered = {
            let mut buffers = self.buffers.write().await;
            let buffer = buffers.entry(run_id.clone()).or_default();
            buffer.push(event);
            buffer.len()
        };

        if terminal || buffered >= FLUSH_THRESHOLD {
            self.flush(&run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: &RunId) -> Result<Vec<Event>> {
        // Flush any buffered events first
        self.flush(run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::types::WorkflowId;
    use tempfile::TempDir;

    fn started(run_id: &RunId) -> Event {
        Event::new(
            run_id.clone(),
            EventType::RunStarted {
                workflow_id: WorkflowId::new("wf"),
            },
        )
    }

    #[tokio::test]
    async fn test_terminal_event_flushes_run() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new("r1");

        log.append(started(&run_id)).await.unwrap();
        assert!(log.get_log_files(&run_id).unwrap().is_empty());

        log.append(Event::new(run_id.clone(), EventType::RunCompleted { duration_ms: 3 }))
            .await
            .unwrap();
        assert_eq!(log.get_log_files(&run_id).unwrap().len(), 1);

        let events = log.get_run_events(&run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].event_type.is_terminal());
    }

    #[tokio::test]
    async fn test_buffers_are_per_run() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let a = RunId::new("a");
        let b = RunId::new("b");

        log.append(started(&a)).await.unwrap();
        log.append(started(&b)).await.unwrap();
        log.append(started(&b)).await.unwrap();

        // Reading one run must not write the other run's events to its file
        assert_eq!(log.get_run_events(&a).await.unwrap().len(), 1);
        assert_eq!(log.get_run_events(&b).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_appends_accumulate_across_flushes() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let run_id = RunId::new("r1");

        log.append(started(&run_id)).await.unwrap();
        log.flush_all().await.unwrap();
        log.append(Event::new(run_id.clone(), EventType::RunCancelled { executed_nodes: 0 }))
            .await
            .unwrap();

        let reopened = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.get_run_events(&run_id).await.unwrap().len(), 2);
    }
}
