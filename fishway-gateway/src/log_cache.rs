/**
 * LOG CACHE - Bounded in-memory ring of device log text
 *
 * ROLE:
 * Devices push plain-text log lines on `<id>/device/log/<name>`. The panel
 * only ever wants "the last N KiB" of a stream, so we keep a per
 * (device, stream) queue of byte chunks under a fixed byte budget.
 *
 * HOW:
 * - append splits text into chunks of at most `max_chunk_bytes`
 * - oldest chunks are dropped while the stream is over budget
 * - tail walks chunks from the newest end, never concatenating the whole stream
 *
 * Nothing here is persisted: a restart loses the cache, devices refill it.
 */

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

use crate::config::LogCacheConf;
use crate::topics::DEFAULT_LOG_STREAM;

const KEY_PART_MAX: usize = 64;

struct LogStream {
    chunks: VecDeque<Vec<u8>>,
    /// Always the sum of `chunks` lengths.
    bytes: usize,
    updated_at: OffsetDateTime,
}

pub struct LogCache {
    max_bytes: usize,
    max_chunk_bytes: usize,
    streams: Mutex<HashMap<String, LogStream>>,
}

impl LogCache {
    pub fn new(max_bytes: usize, max_chunk_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.clamp(16 * 1024, 2 * 1024 * 1024),
            max_chunk_bytes: max_chunk_bytes.clamp(128, 16 * 1024),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(conf: &LogCacheConf) -> Self {
        Self::new(conf.max_bytes, conf.max_chunk_bytes)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn append(&self, device_id: &str, name: &str, text: &str) {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return;
        }

        let key = stream_key(device_id, name);
        let mut streams = self.streams.lock();
        let stream = streams.entry(key).or_insert_with(|| LogStream {
            chunks: VecDeque::new(),
            bytes: 0,
            updated_at: OffsetDateTime::now_utc(),
        });

        for chunk in bytes.chunks(self.max_chunk_bytes) {
            stream.chunks.push_back(chunk.to_vec());
            stream.bytes += chunk.len();
        }
        stream.updated_at = OffsetDateTime::now_utc();

        while stream.bytes > self.max_bytes {
            match stream.chunks.pop_front() {
                Some(oldest) => stream.bytes -= oldest.len(),
                None => break,
            }
        }
    }

    pub fn clear(&self, device_id: &str, name: &str) {
        self.streams.lock().remove(&stream_key(device_id, name));
    }

    pub fn has_data(&self, device_id: &str, name: &str) -> bool {
        self.streams
            .lock()
            .get(&stream_key(device_id, name))
            .map(|s| s.bytes > 0)
            .unwrap_or(false)
    }

    pub fn updated_at(&self, device_id: &str, name: &str) -> Option<OffsetDateTime> {
        self.streams.lock().get(&stream_key(device_id, name)).map(|s| s.updated_at)
    }

    /// Bytes currently retained for one stream.
    pub fn retained_bytes(&self, device_id: &str, name: &str) -> usize {
        self.streams.lock().get(&stream_key(device_id, name)).map(|s| s.bytes).unwrap_or(0)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Last `max_bytes` bytes of a stream (clamped to the budget), decoded
    /// lossily. A chunk may be cut at the boundary.
    pub fn tail(&self, device_id: &str, name: &str, max_bytes: usize) -> String {
        let want = max_bytes.min(self.max_bytes);
        if want == 0 {
            return String::new();
        }

        let streams = self.streams.lock();
        let Some(stream) = streams.get(&stream_key(device_id, name)) else {
            return String::new();
        };
        if stream.bytes == 0 {
            return String::new();
        }

        if want >= stream.bytes {
            let mut out = Vec::with_capacity(stream.bytes);
            for chunk in &stream.chunks {
                out.extend_from_slice(chunk);
            }
            return String::from_utf8_lossy(&out).into_owned();
        }

        let mut remaining = want;
        let mut parts: Vec<&[u8]> = Vec::new();
        for chunk in stream.chunks.iter().rev() {
            if remaining == 0 {
                break;
            }
            if chunk.len() <= remaining {
                parts.push(chunk);
                remaining -= chunk.len();
            } else {
                parts.push(&chunk[chunk.len() - remaining..]);
                remaining = 0;
            }
        }

        let mut out = Vec::with_capacity(want);
        for part in parts.iter().rev() {
            out.extend_from_slice(part);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

fn stream_key(device_id: &str, name: &str) -> String {
    let name = if name.trim().is_empty() { DEFAULT_LOG_STREAM } else { name };
    format!("{}:{}", safe_key_part(device_id), safe_key_part(name))
}

/// Lowercase, `[a-z0-9._-]` only (other runs collapse to `_`), at most 64 chars.
fn safe_key_part(s: &str) -> String {
    let mut out = String::new();
    let mut in_run = false;
    for c in s.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out.truncate(KEY_PART_MAX);
    out
}
