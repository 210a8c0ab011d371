//! Outbox-based messaging sink.
//!
//! The daemon never talks to the chat platform directly; it appends
//! framed JSON records to a per-unit outbox file that the external
//! relay drains. Image attachments are written alongside and
//! referenced by path, keeping the record stream line-delimited.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use scrimd_core::notify::{
    DeliveryId, Destination, MessagingSink, NoticePayload, NotifyError,
};
use scrimd_core::unit::UnitId;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// One record in an outbox file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SinkRecord {
    /// Deliver a new notice.
    Send {
        /// Delivery id minted for this notice.
        delivery_id: DeliveryId,
        /// Where the relay should post it.
        destination: Destination,
        /// Plain-text body.
        text: String,
        /// Attachment written next to the outbox file, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<PathBuf>,
    },
    /// Replace a previously delivered notice.
    Edit {
        /// The notice being replaced.
        delivery_id: DeliveryId,
        /// New body.
        text: String,
    },
    /// Remove a previously delivered notice.
    Delete {
        /// The notice being removed.
        delivery_id: DeliveryId,
    },
}

/// Messaging sink that appends to per-unit outbox files.
pub struct OutboxSink {
    dir: PathBuf,
}

impl OutboxSink {
    /// Creates a sink rooted at the outbox directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of a unit's outbox file.
    #[must_use]
    pub fn outbox_path(&self, unit: &UnitId) -> PathBuf {
        self.dir.join(format!("{unit}.jsonl"))
    }

    async fn append(&self, unit: &UnitId, record: &SinkRecord) -> Result<(), NotifyError> {
        let line = serde_json::to_string(record).map_err(|e| {
            NotifyError::Io(std::io::Error::other(format!("encode outbox record: {e}")))
        })?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_path(unit))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn stage_attachment(
        &self,
        unit: &UnitId,
        id: &DeliveryId,
        image: &[u8],
    ) -> Result<PathBuf, NotifyError> {
        let dir = self.dir.join(format!("{unit}-attachments"));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{id}.png"));
        tokio::fs::write(&path, image).await?;
        Ok(path)
    }
}

#[async_trait]
impl MessagingSink for OutboxSink {
    async fn send(
        &self,
        unit: &UnitId,
        destination: Destination,
        payload: NoticePayload,
    ) -> Result<DeliveryId, NotifyError> {
        let delivery_id = DeliveryId::new();
        let attachment = match &payload.image {
            Some(image) => Some(self.stage_attachment(unit, &delivery_id, image).await?),
            None => None,
        };
        self.append(
            unit,
            &SinkRecord::Send {
                delivery_id: delivery_id.clone(),
                destination,
                text: payload.text,
                attachment,
            },
        )
        .await?;
        Ok(delivery_id)
    }

    async fn edit(
        &self,
        unit: &UnitId,
        id: &DeliveryId,
        payload: NoticePayload,
    ) -> Result<(), NotifyError> {
        self.append(
            unit,
            &SinkRecord::Edit {
                delivery_id: id.clone(),
                text: payload.text,
            },
        )
        .await
    }

    async fn delete(&self, unit: &UnitId, id: &DeliveryId) -> Result<(), NotifyError> {
        self.append(
            unit,
            &SinkRecord::Delete {
                delivery_id: id.clone(),
            },
        )
        .await
    }
}

/// In-memory sink for tests: records every operation and can be told
/// to fail sends to exercise rollback paths.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(UnitId, SinkRecord)>>,
    fail_sends: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent sends fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Everything recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the record lock is poisoned (test-only type).
    #[must_use]
    pub fn records(&self) -> Vec<(UnitId, SinkRecord)> {
        self.records.lock().expect("sink lock").clone()
    }

    /// Sends recorded for one destination.
    #[must_use]
    pub fn sends_to(&self, destination: &Destination) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|(_, record)| match record {
                SinkRecord::Send {
                    destination: d,
                    text,
                    ..
                } if d == *destination => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessagingSink for MemorySink {
    async fn send(
        &self,
        unit: &UnitId,
        destination: Destination,
        payload: NoticePayload,
    ) -> Result<DeliveryId, NotifyError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::Unavailable {
                destination,
                detail: "injected failure".to_string(),
            });
        }
        let delivery_id = DeliveryId::new();
        self.records.lock().expect("sink lock").push((
            unit.clone(),
            SinkRecord::Send {
                delivery_id: delivery_id.clone(),
                destination,
                text: payload.text,
                attachment: None,
            },
        ));
        Ok(delivery_id)
    }

    async fn edit(
        &self,
        unit: &UnitId,
        id: &DeliveryId,
        payload: NoticePayload,
    ) -> Result<(), NotifyError> {
        self.records.lock().expect("sink lock").push((
            unit.clone(),
            SinkRecord::Edit {
                delivery_id: id.clone(),
                text: payload.text,
            },
        ));
        Ok(())
    }

    async fn delete(&self, unit: &UnitId, id: &DeliveryId) -> Result<(), NotifyError> {
        self.records.lock().expect("sink lock").push((
            unit.clone(),
            SinkRecord::Delete {
                delivery_id: id.clone(),
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_outbox_appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutboxSink::open(dir.path()).unwrap();
        let u = unit("or40");

        let id = sink
            .send(&u, Destination::Holder, NoticePayload::text("first"))
            .await
            .unwrap();
        sink.edit(&u, &id, NoticePayload::text("second"))
            .await
            .unwrap();
        sink.delete(&u, &id).await.unwrap();

        let content = std::fs::read_to_string(sink.outbox_path(&u)).unwrap();
        let records: Vec<SinkRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], SinkRecord::Send { .. }));
        assert!(matches!(records[2], SinkRecord::Delete { .. }));
    }

    #[tokio::test]
    async fn test_outbox_stages_attachments_beside_stream() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutboxSink::open(dir.path()).unwrap();
        let u = unit("or40");

        sink.send(
            &u,
            Destination::General,
            NoticePayload::text("notice").with_image(vec![1, 2, 3]),
        )
        .await
        .unwrap();

        let content = std::fs::read_to_string(sink.outbox_path(&u)).unwrap();
        let record: SinkRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        let SinkRecord::Send {
            attachment: Some(path),
            ..
        } = record
        else {
            panic!("expected send with attachment");
        };
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_memory_sink_failure_injection() {
        let sink = MemorySink::new();
        let u = unit("or40");
        sink.set_fail_sends(true);
        assert!(sink
            .send(&u, Destination::Holder, NoticePayload::text("x"))
            .await
            .is_err());
        sink.set_fail_sends(false);
        assert!(sink
            .send(&u, Destination::Holder, NoticePayload::text("x"))
            .await
            .is_ok());
        assert_eq!(sink.records().len(), 1);
    }
}
