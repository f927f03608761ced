//! Per-recipient inbox directories of text artifacts
//!
//! Each delivered message becomes one file
//! `<inbox_root>/<recipient>/<YYYYmmddTHHMMSS.ffffffZ>_<message-id>.txt`:
//!
//! ```text
//! From: planner
//! To: builder
//! Priority: high
//! Message-ID: 0b0c6c1e-...
//! Timestamp: 2026-10-18T09:12:44.120431+00:00
//! Type: task
//!
//! Build the release artifacts.
//! ```
//!
//! The file name derives from the message's creation time and id, so a
//! redelivered message maps to the same file and is written only once.

use super::{Deliver, DeliveryError};
use crate::schema::{Message, MessageType, Priority};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Writes messages into per-recipient inbox directories
#[derive(Debug, Clone)]
pub struct InboxDelivery {
    root: PathBuf,
}

impl InboxDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact for `message`
    pub fn artifact_path(&self, message: &Message) -> PathBuf {
        self.root
            .join(&message.recipient)
            .join(artifact_name(message))
    }
}

impl Deliver for InboxDelivery {
    fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        if !is_plain_name(&message.recipient) {
            return Err(DeliveryError::Rejected(format!(
                "invalid recipient name '{}'",
                message.recipient
            )));
        }

        let target = self.artifact_path(message);
        if target.exists() {
            debug!(message_id = %message.id, path = %target.display(), "inbox artifact already present");
            return Ok(());
        }

        let dir = self.root.join(&message.recipient);
        fs::create_dir_all(&dir).map_err(|e| DeliveryError::io(&dir, e))?;

        let tmp = dir.join(format!(".{}.tmp-{}", message.id, std::process::id()));
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(render(message).as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(DeliveryError::io(&tmp, e));
        }

        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(DeliveryError::io(&target, e));
        }

        debug!(message_id = %message.id, path = %target.display(), "inbox artifact written");
        Ok(())
    }
}

/// A delivered message read back from an inbox directory
#[derive(Debug, Clone, PartialEq)]
pub struct InboxItem {
    pub path: PathBuf,
    pub from: String,
    pub to: String,
    pub priority: Priority,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub content: String,
}

/// Read every artifact in `agent`'s inbox, ordered by file name
///
/// A missing inbox is empty. Files that do not parse are logged and skipped.
pub fn read_inbox(root: &Path, agent: &str) -> Result<Vec<InboxItem>, DeliveryError> {
    let dir = root.join(agent);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DeliveryError::io(&dir, e)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| DeliveryError::io(&dir, e))?.path();
        let is_artifact = path.extension().is_some_and(|ext| ext == "txt")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'));
        if is_artifact {
            paths.push(path);
        }
    }
    paths.sort();

    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path).map_err(|e| DeliveryError::io(&path, e))?;
        match parse_artifact(&text) {
            Some(item) => items.push(InboxItem { path, ..item }),
            None => warn!(path = %path.display(), "skipping unparseable inbox artifact"),
        }
    }
    Ok(items)
}

fn artifact_name(message: &Message) -> String {
    format!(
        "{}_{}.txt",
        message.created_at.format("%Y%m%dT%H%M%S%.6fZ"),
        message.id
    )
}

fn render(message: &Message) -> String {
    format!(
        "From: {}\nTo: {}\nPriority: {}\nMessage-ID: {}\nTimestamp: {}\nType: {}\n\n{}",
        message.sender,
        message.recipient,
        message.priority,
        message.id,
        message.created_at.to_rfc3339(),
        message.message_type,
        message.content
    )
}

fn parse_artifact(text: &str) -> Option<InboxItem> {
    let (header, content) = text.split_once("\n\n")?;

    let mut from = None;
    let mut to = None;
    let mut priority = None;
    let mut message_id = None;
    let mut timestamp = None;
    let mut message_type = None;

    for line in header.lines() {
        let (key, value) = line.split_once(": ")?;
        match key {
            "From" => from = Some(value.to_string()),
            "To" => to = Some(value.to_string()),
            "Priority" => priority = value.parse().ok(),
            "Message-ID" => message_id = Some(value.to_string()),
            "Timestamp" => {
                timestamp = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            "Type" => message_type = value.parse().ok(),
            _ => {}
        }
    }

    Some(InboxItem {
        path: PathBuf::new(),
        from: from?,
        to: to?,
        priority: priority?,
        message_id: message_id?,
        timestamp: timestamp?,
        message_type: message_type?,
        content: content.to_string(),
    })
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(to: &str, content: &str) -> Message {
        Message::new("planner", to, MessageType::Task, content, Priority::High)
    }

    #[test]
    fn test_deliver_writes_header_and_content() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = InboxDelivery::new(temp_dir.path());
        let msg = message("builder", "Build the release.\n\nThen tag it.");

        inbox.deliver(&msg).unwrap();

        let path = inbox.artifact_path(&msg);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("From: planner\nTo: builder\nPriority: high\n"));
        assert!(text.contains(&format!("Message-ID: {}\n", msg.id)));
        assert!(text.contains("Type: task\n\n"));
        assert!(text.ends_with("Build the release.\n\nThen tag it."));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(&format!("Z_{}.txt", msg.id)));
        assert_eq!(name.find('T'), Some(8));
    }

    #[test]
    fn test_redelivery_leaves_existing_file_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = InboxDelivery::new(temp_dir.path());
        let msg = message("builder", "original");

        inbox.deliver(&msg).unwrap();
        let path = inbox.artifact_path(&msg);
        fs::write(&path, "edited by reader").unwrap();

        inbox.deliver(&msg).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "edited by reader");
    }

    #[test]
    fn test_rejects_path_like_recipient() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = InboxDelivery::new(temp_dir.path());

        for bad in ["../escape", "a/b", "", "."] {
            let err = inbox.deliver(&message(bad, "x")).unwrap_err();
            assert!(matches!(err, DeliveryError::Rejected(_)), "{bad}");
        }
    }

    #[test]
    fn test_read_inbox_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = InboxDelivery::new(temp_dir.path());
        let first = message("builder", "first");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = message("builder", "second");

        inbox.deliver(&second).unwrap();
        inbox.deliver(&first).unwrap();
        fs::write(temp_dir.path().join("builder").join("notes.md"), "ignored").unwrap();

        let items = read_inbox(temp_dir.path(), "builder").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].message_id, first.id);
        assert_eq!(items[0].content, "first");
        assert_eq!(items[0].from, "planner");
        assert_eq!(items[0].priority, Priority::High);
        assert_eq!(items[0].message_type, MessageType::Task);
        assert_eq!(items[0].timestamp, first.created_at);
        assert_eq!(items[1].message_id, second.id);
    }

    #[test]
    fn test_read_missing_inbox_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(read_inbox(temp_dir.path(), "nobody").unwrap().is_empty());
    }

    #[test]
    fn test_unparseable_artifact_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("builder");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("20260101T000000.000000Z_x.txt"), "garbage").unwrap();

        assert!(read_inbox(temp_dir.path(), "builder").unwrap().is_empty());
    }
}
