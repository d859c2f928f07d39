//! Directory-backed transport addressed as `file:///<dir>`.
//!
//! The source picks up one file per poll, oldest name first, and deletes it
//! once published. Files that fail before publish are renamed with a
//! `.rejected` suffix so they are not picked up again. The sink writes one
//! `<message-id>.msg` file per envelope, staged through a `.tmp` file.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    switchyard_common::{Envelope, Error, PayloadCodec, Result},
    tracing::{debug, warn},
    url::Url,
};

use crate::transport::{MessageSink, MessageSource, RawMessage, envelope_bytes};

const REJECTED_SUFFIX: &str = "rejected";
const TEMP_SUFFIX: &str = "tmp";
const MESSAGE_SUFFIX: &str = "msg";
pub const FILE_NAME_ITEM: &str = "file-name";

/// Directory named by a `file:` URI. Absolute paths go through
/// `to_file_path`; anything else is host plus path.
pub fn directory(uri: &Url) -> Result<PathBuf> {
    if let Ok(path) = uri.to_file_path() {
        return Ok(path);
    }
    let host = uri.host_str().unwrap_or_default();
    let joined = format!("{host}{}", uri.path());
    if joined.is_empty() {
        return Err(Error::adapter(uri.as_str(), "file uri does not name a directory"));
    }
    Ok(PathBuf::from(joined))
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.extension().is_some_and(|ext| ext == suffix)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// `file-in`
pub struct FileSource {
    dir: PathBuf,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn release(&self, path: &Path) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    async fn candidates(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file()
                || is_hidden(&path)
                || has_suffix(&path, REJECTED_SUFFIX)
                || has_suffix(&path, TEMP_SUFFIX)
            {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl MessageSource for FileSource {
    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    async fn on_start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<RawMessage>> {
        let candidates = self.candidates().await?;
        let claimed = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            candidates
                .into_iter()
                .find(|path| !in_flight.contains(path))
                .inspect(|path| {
                    in_flight.insert(path.clone());
                })
        };
        let Some(path) = claimed else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.release(&path);
                return Err(err.into());
            },
        };
        let mut raw = RawMessage::new(bytes).with_receipt(path.to_string_lossy());
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            raw.header.set_item(FILE_NAME_ITEM, name);
        }
        debug!(path = %path.display(), "file picked up");
        Ok(Some(raw))
    }

    async fn acknowledge(&self, message: &RawMessage) -> Result<()> {
        let Some(receipt) = message.receipt.as_deref() else {
            return Ok(());
        };
        let path = PathBuf::from(receipt);
        let removed = tokio::fs::remove_file(&path).await;
        self.release(&path);
        removed?;
        Ok(())
    }

    async fn reject(&self, message: &RawMessage) -> Result<()> {
        let Some(receipt) = message.receipt.as_deref() else {
            return Ok(());
        };
        let path = PathBuf::from(receipt);
        let mut rejected = path.clone().into_os_string();
        rejected.push(".");
        rejected.push(REJECTED_SUFFIX);
        let renamed = tokio::fs::rename(&path, &rejected).await;
        self.release(&path);
        if let Err(err) = &renamed {
            warn!(path = %path.display(), error = %err, "could not mark file as rejected");
        }
        renamed?;
        Ok(())
    }
}

/// `file-out`
pub struct FileSink {
    dir: PathBuf,
    codec: Arc<dyn PayloadCodec>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, codec: Arc<dyn PayloadCodec>) -> Self {
        Self {
            dir: dir.into(),
            codec,
        }
    }

    fn file_stem(envelope: &Envelope) -> String {
        envelope
            .header
            .message_id()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

#[async_trait]
impl MessageSink for FileSink {
    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    async fn on_start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope_bytes(envelope, self.codec.as_ref())?;
        let stem = Self::file_stem(envelope);
        let staging = self.dir.join(format!("{stem}.{TEMP_SUFFIX}"));
        let target = self.dir.join(format!("{stem}.{MESSAGE_SUFFIX}"));
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &target).await?;
        debug!(path = %target.display(), bytes = bytes.len(), "envelope written");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, switchyard_common::JsonCodec};

    #[tokio::test]
    async fn source_reads_oldest_and_acknowledge_deletes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.msg"), "second").unwrap();
        std::fs::write(dir.path().join("a.msg"), "first").unwrap();
        std::fs::write(dir.path().join(".hidden"), "skip").unwrap();

        let source = FileSource::new(dir.path());
        let raw = source.receive().await.unwrap().unwrap();
        assert_eq!(raw.bytes, b"first");
        assert_eq!(raw.header.item(FILE_NAME_ITEM), Some("a.msg"));

        // In-flight files are not handed out twice.
        let next = source.receive().await.unwrap().unwrap();
        assert_eq!(next.bytes, b"second");
        assert!(source.receive().await.unwrap().is_none());

        source.acknowledge(&raw).await.unwrap();
        assert!(!dir.path().join("a.msg").exists());
    }

    #[tokio::test]
    async fn rejected_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.msg"), "x").unwrap();
        let source = FileSource::new(dir.path());
        let raw = source.receive().await.unwrap().unwrap();
        source.reject(&raw).await.unwrap();
        assert!(dir.path().join("bad.msg.rejected").exists());
        assert!(source.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sink_writes_one_file_per_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sink = FileSink::new(&out, Arc::new(JsonCodec::new()));
        sink.on_start().await.unwrap();

        let mut envelope = Envelope::new("payload".to_string());
        envelope.header.override_message_id("m/1").unwrap();
        sink.deliver(&envelope).await.unwrap();

        let written = std::fs::read_to_string(out.join("m_1.msg")).unwrap();
        assert_eq!(written, "payload");
        assert!(!out.join("m_1.tmp").exists());
    }

    #[test]
    fn directory_from_uri() {
        assert_eq!(
            directory(&Url::parse("file:///var/spool/in").unwrap()).unwrap(),
            PathBuf::from("/var/spool/in")
        );
    }
}
