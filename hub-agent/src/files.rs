//! File-backed collaborators for the engine
//!
//! [`FileRuleSource`] re-reads its JSON rule table on every fetch so edits to
//! the file are picked up on the next snapshot refresh. [`JsonlEventSink`]
//! appends one JSON object per recorded event.

use async_trait::async_trait;
use hub_common::{RecordedEvent, RuleKind, RuleRecord};
use intercept_core::{EngineError, EventSink, Result, RuleSource};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record in the file, enabled or not
    pub async fn load(&self) -> Result<Vec<RuleRecord>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::StoreUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EngineError::StoreUnavailable(format!("{}: invalid rule table: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn fetch_enabled_rules(&self, device_id: &str, kind: RuleKind) -> Result<Vec<RuleRecord>> {
        let records: Vec<RuleRecord> = self
            .load()
            .await?
            .into_iter()
            .filter(|record| record.kind() == kind)
            .filter(|record| record.meta().enabled && record.meta().applies_to_device(device_id))
            .collect();
        debug!(device_id, %kind, count = records.len(), "Loaded rules from file");
        Ok(records)
    }
}

pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventSink {
    /// Open `path` for appending, creating it if needed
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn append_event(&self, event: RecordedEvent) -> Result<()> {
        let mut line = serde_json::to_string(&event).map_err(|e| EngineError::Sink(e.to_string()))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::{HttpEvent, HttpExchange, MockRuleRecord, RuleMeta};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn mock(meta: RuleMeta) -> RuleRecord {
        RuleRecord::Mock(MockRuleRecord {
            meta,
            target_type: "http".to_string(),
            condition_json: r#"{"url_pattern":"/api/**"}"#.to_string(),
            action_json: r#"{"status_code":200}"#.to_string(),
        })
    }

    fn rules_file(records: &[RuleRecord]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(records).unwrap().as_bytes())
            .unwrap();
        file
    }

    #[tokio::test]
    async fn test_fetch_filters_kind_enabled_and_device() {
        let file = rules_file(&[
            mock(RuleMeta::new("global", "global", 1)),
            mock(RuleMeta::new("d1", "d1 only", 1).for_device("D1")),
            mock(RuleMeta::new("d2", "d2 only", 1).for_device("D2")),
            mock(RuleMeta::new("off", "disabled", 1).disabled()),
        ]);
        let source = FileRuleSource::new(file.path());

        let mut ids: Vec<String> = source
            .fetch_enabled_rules("D1", RuleKind::Mock)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["d1", "global"]);

        let breakpoints = source
            .fetch_enabled_rules("D1", RuleKind::Breakpoint)
            .await
            .unwrap();
        assert!(breakpoints.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_rules_are_store_unavailable() {
        let source = FileRuleSource::new("/nonexistent/rules.json");
        let err = source.fetch_enabled_rules("D1", RuleKind::Mock).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[{\"kind\":").unwrap();
        let source = FileRuleSource::new(file.path());
        let err = source.fetch_enabled_rules("D1", RuleKind::Mock).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlEventSink::create(&path).await.unwrap();

        for url in ["https://a.example.com/", "https://b.example.com/"] {
            let exchange = HttpExchange::new("D1", "GET", url);
            sink.append_event(RecordedEvent::Http(HttpEvent::from_exchange(&exchange)))
                .await
                .unwrap();
        }

        let written = std::fs::read_to_string(&path).unwrap();
        let events: Vec<RecordedEvent> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        match &events[1] {
            RecordedEvent::Http(event) => assert_eq!(event.url, "https://b.example.com/"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
