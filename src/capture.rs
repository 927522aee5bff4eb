//! Response capture: append-only JSON-lines record of failed requests.
//!
//! Every network failure or non-2xx response is appended as a single JSON
//! line to `responses.json` in the capture directory. Writes from all
//! workers are serialized through a `tokio::sync::Mutex`, and each record
//! is written with one `write_all` and flushed before the lock is released,
//! so records never interleave.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use http::header::HeaderValue;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CapturedFailure
// ---------------------------------------------------------------------------

/// How `responseData` is rendered in a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// The body was valid UTF-8 and no other charset was declared.
    Utf8,
    /// Raw bytes, standard base64.
    Base64,
}

/// One captured failure, serialized as a JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedFailure {
    /// RFC 3339 time the record was created.
    pub timestamp: String,
    pub run_id: Uuid,
    pub worker: usize,
    /// The worker's request count including this request (1-based).
    pub request_number: i64,
    /// Response status, `0` when no response head arrived.
    pub status_code: u16,
    pub url: String,
    pub encoding: BodyEncoding,
    pub response_data: String,
}

impl CapturedFailure {
    /// Build a record, choosing the body rendering from the declared
    /// content type and the bytes themselves.
    pub fn new(
        run_id: Uuid,
        worker: usize,
        request_number: i64,
        status_code: u16,
        url: impl Into<String>,
        content_type: Option<&HeaderValue>,
        body: &Bytes,
    ) -> Self {
        let (encoding, response_data) = encode_body(content_type, body);
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id,
            worker,
            request_number,
            status_code,
            url: url.into(),
            encoding,
            response_data,
        }
    }

    /// Recover the raw body bytes.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        match self.encoding {
            BodyEncoding::Utf8 => Ok(self.response_data.as_bytes().to_vec()),
            BodyEncoding::Base64 => BASE64
                .decode(&self.response_data)
                .context("captured body is not valid base64"),
        }
    }
}

/// Render `body` as text only when that is lossless: the response declared
/// no charset or a UTF-8 one, and the bytes decode as UTF-8.
fn encode_body(content_type: Option<&HeaderValue>, body: &Bytes) -> (BodyEncoding, String) {
    let declared_utf8 = match content_type.and_then(|v| v.to_str().ok()).and_then(charset) {
        Some(cs) => cs.eq_ignore_ascii_case("utf-8") || cs.eq_ignore_ascii_case("utf8"),
        None => true,
    };

    if declared_utf8 {
        if let Ok(text) = std::str::from_utf8(body) {
            return (BodyEncoding::Utf8, text.to_string());
        }
    }
    (BodyEncoding::Base64, BASE64.encode(body))
}

fn charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// CaptureSink
// ---------------------------------------------------------------------------

/// Append-only capture file shared by all workers.
pub struct CaptureSink {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl CaptureSink {
    /// Open (or create) the capture file at `path` in append mode,
    /// creating its parent directory if needed.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create capture directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open capture file: {}", path.display()))?;

        debug!(path = %path.display(), "capture sink opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Append one record as a JSON line.
    pub async fn append(&self, record: &CapturedFailure) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to serialize capture record")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to capture file: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush capture file: {}", self.path.display()))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
