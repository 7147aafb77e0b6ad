//! iMessage channel — polls the local Messages database for inbound
//! messages and sends replies through Messages.app via `osascript`.
//!
//! Inbound reads are watermark-based: on start the adapter records the
//! current maximum ROWID and only ever forwards rows above it, so history
//! is never replayed. The watermark lives in process memory only.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{
    Channel, ConnectionStatus, InboundHandler, StatusCell, not_connected_result,
};
use crate::config::ImessageConfig;
use crate::envelope::{
    ChannelKind, DeliveryResult, EgressEnvelope, IngressEnvelope, MediaItem, MediaKind,
};
use crate::error::RelayError;

/// Seconds between the Unix epoch and the Apple epoch (2001-01-01T00:00:00Z).
const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;

const OSASCRIPT_BIN: &str = "/usr/bin/osascript";

/// Messages.app refers to group chats by a handle starting with "chat".
fn is_group_handle(conversation_id: &str) -> bool {
    conversation_id.starts_with("chat")
}

/// Convert a chat.db timestamp (nanoseconds since the Apple epoch) to UTC.
/// Zero maps to the Apple epoch exactly.
pub fn apple_ns_to_utc(ns: i64) -> DateTime<Utc> {
    let secs = ns / 1_000_000_000 + APPLE_EPOCH_OFFSET_SECS;
    let sub_ns = (ns % 1_000_000_000).unsigned_abs() as u32;
    Utc.timestamp_opt(secs, sub_ns)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(APPLE_EPOCH_OFFSET_SECS, 0).unwrap())
}

// ── Database access ─────────────────────────────────────────────────────────

/// One row from the message/chat/handle join.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub rowid: i64,
    pub guid: String,
    pub text: Option<String>,
    pub date_ns: i64,
    pub has_attachments: bool,
    pub chat_identifier: Option<String>,
    pub group_id: Option<String>,
    pub display_name: Option<String>,
    pub sender: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub message_id: i64,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub transfer_name: Option<String>,
    pub total_bytes: Option<i64>,
}

/// Read-only handle on the Messages chat database.
///
/// `Connection` holds its internal state in `RefCell`s, so it is `Send` but
/// not `Sync`; the connection is wrapped in a `Mutex` purely so `&ChatDb`
/// satisfies the `Send` bound on the futures that hold it across `.await`
/// points (access is already single-threaded — no real contention).
pub struct ChatDb {
    conn: StdMutex<Connection>,
}

impl ChatDb {
    /// Open the database file read-only. Fails if the process lacks the
    /// privacy permission covering `~/Library/Messages`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open chat database at {}", path.display()))?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    /// Current maximum message ROWID; 0 for an empty table.
    pub fn max_rowid(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .unwrap()
            .query_row("SELECT COALESCE(MAX(ROWID), 0) FROM message", [], |row| {
                row.get(0)
            })
    }

    /// Inbound rows above the watermark, ROWID ascending, capped at `limit`.
    pub fn messages_after(
        &self,
        watermark: i64,
        limit: u32,
    ) -> Result<Vec<MessageRow>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.ROWID, m.guid, m.text, m.date, m.cache_has_attachments, \
                    c.chat_identifier, c.group_id, c.display_name, h.id \
             FROM message m \
             JOIN chat_message_join cmj ON cmj.message_id = m.ROWID \
             JOIN chat c ON c.ROWID = cmj.chat_id \
             LEFT JOIN handle h ON h.ROWID = m.handle_id \
             WHERE m.ROWID > ?1 AND m.is_from_me = 0 \
             ORDER BY m.ROWID ASC \
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![watermark, limit], |row| {
            Ok(MessageRow {
                rowid: row.get(0)?,
                guid: row.get(1)?,
                text: row.get(2)?,
                date_ns: row.get(3)?,
                has_attachments: row.get::<_, i64>(4)? != 0,
                chat_identifier: row.get(5)?,
                group_id: row.get(6)?,
                display_name: row.get(7)?,
                sender: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    /// Attachment metadata for the given message ROWIDs.
    pub fn attachments_for(&self, ids: &[i64]) -> Result<Vec<AttachmentRow>, rusqlite::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT maj.message_id, a.filename, a.mime_type, a.transfer_name, a.total_bytes \
             FROM attachment a \
             JOIN message_attachment_join maj ON maj.attachment_id = a.ROWID \
             WHERE maj.message_id IN ({placeholders}) \
             ORDER BY maj.message_id, a.ROWID"
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok(AttachmentRow {
                message_id: row.get(0)?,
                filename: row.get(1)?,
                mime_type: row.get(2)?,
                transfer_name: row.get(3)?,
                total_bytes: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}

/// Missing tables mean this isn't a Messages database (or the schema moved
/// under us) — not something a retry will fix.
fn is_schema_error(err: &rusqlite::Error) -> bool {
    err.to_string().contains("no such table") || err.to_string().contains("no such column")
}

/// Busy/locked reads resolve on the next tick; Messages.app writes briefly.
fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

// ── Normalization ───────────────────────────────────────────────────────────

/// Normalize a database row (plus its attachment rows) into an ingress
/// envelope. Returns `None` for rows with neither text nor named
/// attachments — those are dropped silently.
pub fn normalize_row(row: &MessageRow, attachments: &[AttachmentRow]) -> Option<IngressEnvelope> {
    let media: Vec<MediaItem> = attachments
        .iter()
        .filter(|a| a.message_id == row.rowid)
        .filter_map(|a| {
            let filename = a.filename.as_deref()?;
            Some(MediaItem {
                kind: MediaKind::from_mime(a.mime_type.as_deref()),
                ref_: filename.to_string(),
                mime_type: a.mime_type.clone(),
                file_name: a.transfer_name.clone(),
                size: a.total_bytes.and_then(|b| u64::try_from(b).ok()),
            })
        })
        .collect();

    let text = row.text.clone().unwrap_or_default();
    if text.is_empty() && media.is_empty() {
        return None;
    }

    let conversation_id = row.chat_identifier.clone()?;
    let peer_id = row.sender.clone().unwrap_or_else(|| conversation_id.clone());
    let is_group = row.group_id.is_some();

    Some(IngressEnvelope {
        channel: ChannelKind::Imessage,
        platform_message_id: row.guid.clone(),
        conversation_id,
        peer_id,
        peer_display: None,
        text,
        is_group,
        group_name: if is_group { row.display_name.clone() } else { None },
        timestamp: apple_ns_to_utc(row.date_ns),
        thread_id: None,
        reply_to_message_id: None,
        mentions: None,
        media: if media.is_empty() { None } else { Some(media) },
    })
}

// ── Polling engine ──────────────────────────────────────────────────────────

/// Run one poll tick: read rows above the watermark, forward each in ROWID
/// order, and return the advanced watermark.
///
/// The watermark moves past a row after its callback attempt whether or not
/// the forward succeeded — a failed forward is permanently skipped rather
/// than stalling the reader.
pub async fn poll_once(
    db: &ChatDb,
    watermark: i64,
    batch_size: u32,
    on_inbound: &InboundHandler,
) -> Result<i64> {
    let rows = match db.messages_after(watermark, batch_size) {
        Ok(rows) => rows,
        Err(e) if is_schema_error(&e) => {
            bail!("chat database schema mismatch: {e}");
        }
        Err(e) if is_busy_error(&e) => {
            debug!("chat database busy, retrying next tick");
            return Ok(watermark);
        }
        Err(e) => {
            warn!("chat database read failed: {e}");
            return Ok(watermark);
        }
    };

    if rows.is_empty() {
        return Ok(watermark);
    }

    let with_attachments: Vec<i64> = rows
        .iter()
        .filter(|r| r.has_attachments)
        .map(|r| r.rowid)
        .collect();
    let attachments = if with_attachments.is_empty() {
        Vec::new()
    } else {
        match db.attachments_for(&with_attachments) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("attachment lookup failed: {e}");
                Vec::new()
            }
        }
    };

    let mut watermark = watermark;
    for row in &rows {
        if let Some(envelope) = normalize_row(row, &attachments) {
            if let Err(e) = on_inbound(envelope).await {
                warn!(rowid = row.rowid, "inbound forward failed: {e:#}");
            }
        }
        watermark = watermark.max(row.rowid);
    }

    Ok(watermark)
}

// ── Outbound sending ────────────────────────────────────────────────────────

/// Failure modes of the OS automation bridge.
#[derive(Debug)]
pub enum SendError {
    /// Messages.app rejected the send; retrying will not help.
    Rejected(String),
    /// The bridge itself failed (spawn error, timeout); worth retrying.
    Transient(String),
}

/// The OS automation channel used for sending.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, to: &str, text: &str, is_group: bool) -> Result<(), SendError>;
}

const SEND_DIRECT_SCRIPT: &str = "on run {targetId, messageText}\n\
     tell application \"Messages\"\n\
         set targetService to 1st account whose service type = iMessage\n\
         send messageText to participant targetId of targetService\n\
     end tell\n\
 end run";

const SEND_GROUP_SCRIPT: &str = "on run {targetId, messageText}\n\
     tell application \"Messages\"\n\
         send messageText to chat id targetId\n\
     end tell\n\
 end run";

/// Sends through Messages.app via `osascript`. Recipient and body are
/// passed as script arguments, never interpolated into the source.
pub struct OsaScriptSender;

#[async_trait]
impl MessageSender for OsaScriptSender {
    async fn send(&self, to: &str, text: &str, is_group: bool) -> Result<(), SendError> {
        let script = if is_group {
            SEND_GROUP_SCRIPT
        } else {
            SEND_DIRECT_SCRIPT
        };
        let output = tokio::process::Command::new(OSASCRIPT_BIN)
            .arg("-e")
            .arg(script)
            .arg(to)
            .arg(text)
            .output()
            .await
            .map_err(|e| SendError::Transient(format!("failed to run osascript: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SendError::Rejected(format!(
                "Messages.app rejected send: {}",
                stderr.trim()
            )))
        }
    }
}

// ── Channel plugin ──────────────────────────────────────────────────────────

pub struct ImessageChannel {
    db_path: PathBuf,
    poll_interval: std::time::Duration,
    batch_size: u32,
    sender: Arc<dyn MessageSender>,
    status: StatusCell,
    /// Child of the supervisor's token for the running `start`; cancelled
    /// by `logout`.
    session: Mutex<Option<CancellationToken>>,
}

impl ImessageChannel {
    pub fn new(config: &ImessageConfig) -> Self {
        Self::with_sender(config, Arc::new(OsaScriptSender))
    }

    pub fn with_sender(config: &ImessageConfig, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            db_path: config.db_path.clone().unwrap_or_else(default_db_path),
            poll_interval: std::time::Duration::from_millis(config.poll_interval_ms.max(100)),
            batch_size: config.batch_size.max(1),
            sender,
            status: StatusCell::new(),
            session: Mutex::new(None),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library/Messages/chat.db")
}

#[async_trait]
impl Channel for ImessageChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Imessage
    }

    fn display_name(&self) -> &str {
        "iMessage"
    }

    fn is_supported(&self) -> bool {
        cfg!(target_os = "macos")
    }

    fn unsupported_reason(&self) -> Option<String> {
        (!self.is_supported()).then(|| "iMessage requires macOS".to_string())
    }

    async fn login(&self) -> Result<(), RelayError> {
        if !self.is_supported() {
            return Err(RelayError::PlatformUnsupported(
                "iMessage requires macOS".into(),
            ));
        }
        if !self.db_path.exists() {
            return Err(RelayError::PlatformNotAuthenticated(format!(
                "Messages database not found at {} — is Messages signed in?",
                self.db_path.display()
            )));
        }
        ChatDb::open(&self.db_path).map_err(|e| {
            RelayError::PlatformNotAuthenticated(format!(
                "cannot read the Messages database ({e}) — grant Full Disk Access to this binary"
            ))
        })?;
        if !Path::new(OSASCRIPT_BIN).exists() {
            return Err(RelayError::PlatformUnsupported(
                "osascript not found — sending requires macOS automation".into(),
            ));
        }
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        self.db_path.exists() && ChatDb::open(&self.db_path).is_ok()
    }

    async fn start(
        &self,
        on_inbound: InboundHandler,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.status.set(ConnectionStatus::Connecting);

        let session = cancel.child_token();
        *self.session.lock().await = Some(session.clone());

        let result = self.pump(on_inbound, &session).await;

        self.status.set(ConnectionStatus::Disconnected);
        *self.session.lock().await = None;
        result
    }

    async fn deliver(&self, egress: &EgressEnvelope) -> DeliveryResult {
        if self.status.get() != ConnectionStatus::Connected {
            return not_connected_result(ChannelKind::Imessage);
        }

        let is_group = is_group_handle(&egress.conversation_id);
        let body = render_body(egress);
        match self
            .sender
            .send(&egress.conversation_id, &body, is_group)
            .await
        {
            Ok(()) => DeliveryResult::ok(None),
            Err(SendError::Rejected(msg)) => DeliveryResult::failed(msg, false),
            Err(SendError::Transient(msg)) => DeliveryResult::failed(msg, true),
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    async fn logout(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.cancel();
        }
        self.status.set(ConnectionStatus::Disconnected);
    }
}

impl ImessageChannel {
    async fn pump(&self, on_inbound: InboundHandler, cancel: &CancellationToken) -> Result<()> {
        if let Err(e) = self.login().await {
            bail!("{e}");
        }

        let db = ChatDb::open(&self.db_path)?;
        let mut watermark = db
            .max_rowid()
            .context("Failed to read initial watermark")?;
        info!(watermark, "iMessage reader started");

        self.status.set(ConnectionStatus::Connected);

        // Poll first, then sleep: new rows are forwarded as soon as the
        // reader is up, not one interval later.
        loop {
            watermark = poll_once(&db, watermark, self.batch_size, &on_inbound).await?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("iMessage reader cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Message body for the automation bridge: text first, then one media URL
/// per line (Messages unfurls them).
fn render_body(egress: &EgressEnvelope) -> String {
    let mut body = egress.text.clone();
    if let Some(media) = &egress.media {
        for item in media {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&item.url);
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_epoch_zero_maps_exactly() {
        let ts = apple_ns_to_utc(0);
        assert_eq!(ts.to_rfc3339(), "2001-01-01T00:00:00+00:00");
    }

    #[test]
    fn apple_ns_conversion() {
        // 2024-01-01T00:00:00Z is 725846400 s after the Apple epoch.
        let ts = apple_ns_to_utc(725_846_400_000_000_000);
        assert_eq!(ts.timestamp(), 725_846_400 + APPLE_EPOCH_OFFSET_SECS);
    }

    #[test]
    fn group_handles_start_with_chat() {
        assert!(is_group_handle("chat574269384"));
        assert!(!is_group_handle("+15551234567"));
    }

    fn direct_row(rowid: i64, text: Option<&str>) -> MessageRow {
        MessageRow {
            rowid,
            guid: format!("g-{rowid}"),
            text: text.map(String::from),
            date_ns: 0,
            has_attachments: false,
            chat_identifier: Some("+15551234567".into()),
            group_id: None,
            display_name: None,
            sender: Some("+15551234567".into()),
        }
    }

    #[test]
    fn normalize_direct_message() {
        let env = normalize_row(&direct_row(51, Some("hi")), &[]).unwrap();
        assert_eq!(env.platform_message_id, "g-51");
        assert_eq!(env.conversation_id, "+15551234567");
        assert_eq!(env.peer_id, "+15551234567");
        assert!(!env.is_group);
        assert!(env.group_name.is_none());
        assert_eq!(env.text, "hi");
        assert!(env.media.is_none());
    }

    #[test]
    fn normalize_skips_empty_rows() {
        assert!(normalize_row(&direct_row(52, None), &[]).is_none());
        assert!(normalize_row(&direct_row(53, Some("")), &[]).is_none());
    }

    #[test]
    fn normalize_group_with_attachment() {
        let row = MessageRow {
            rowid: 52,
            guid: "g-52".into(),
            text: Some(String::new()),
            date_ns: 0,
            has_attachments: true,
            chat_identifier: Some("chat999".into()),
            group_id: Some("chat999".into()),
            display_name: Some("Team".into()),
            sender: Some("+15550001111".into()),
        };
        let attachments = vec![AttachmentRow {
            message_id: 52,
            filename: Some("/p.jpg".into()),
            mime_type: Some("image/jpeg".into()),
            transfer_name: Some("p.jpg".into()),
            total_bytes: Some(100),
        }];
        let env = normalize_row(&row, &attachments).unwrap();
        assert!(env.is_group);
        assert_eq!(env.group_name.as_deref(), Some("Team"));
        let media = env.media.unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].kind, MediaKind::Image);
        assert_eq!(media[0].ref_, "/p.jpg");
        assert_eq!(media[0].size, Some(100));
    }

    #[test]
    fn attachment_without_filename_is_dropped() {
        let mut row = direct_row(54, Some(""));
        row.has_attachments = true;
        let attachments = vec![AttachmentRow {
            message_id: 54,
            filename: None,
            mime_type: Some("image/jpeg".into()),
            transfer_name: None,
            total_bytes: None,
        }];
        assert!(normalize_row(&row, &attachments).is_none());
    }

    #[test]
    fn render_body_appends_media_urls() {
        let egress = EgressEnvelope {
            channel: ChannelKind::Imessage,
            conversation_id: "+15551234567".into(),
            text: "look".into(),
            thread_id: None,
            reply_to_message_id: None,
            media: Some(vec![crate::envelope::EgressMedia {
                kind: "image".into(),
                url: "https://cdn.example.com/p.jpg".into(),
            }]),
        };
        assert_eq!(render_body(&egress), "look\nhttps://cdn.example.com/p.jpg");
    }
}
