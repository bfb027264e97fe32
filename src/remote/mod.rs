//! Remote chunked-upload store boundary.
//!
//! The pipeline builds remote files through a small resumable-session
//! protocol: `start_session` seeds a session with the first bytes,
//! `append_to_session` extends it at an explicit offset, `finish_session`
//! commits it to a destination path, and `upload_whole` handles files that
//! fit in a single call. Authentication beyond a bearer token, and
//! cleanup of orphaned sessions, are the store operator's concern.
//!
//! Failures carry a type: network failures are retryable, protocol
//! failures are not. Workers decide retry behavior from the variant alone.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod crypto;
pub mod uploader;

/// Error surfaced by any remote store operation.
#[derive(Debug)]
pub enum RemoteStoreError {
    /// Transport-level or server-side failure. Retrying may succeed.
    Network {
        operation: &'static str,
        message: String,
    },
    /// The store understood and rejected the request. Retrying will not
    /// help; this points at a logic error (bad offset, unknown session).
    Protocol {
        operation: &'static str,
        message: String,
    },
}

impl RemoteStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteStoreError::Network { .. })
    }

    fn network(operation: &'static str, message: impl Into<String>) -> Self {
        RemoteStoreError::Network {
            operation,
            message: message.into(),
        }
    }

    fn protocol(operation: &'static str, message: impl Into<String>) -> Self {
        RemoteStoreError::Protocol {
            operation,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStoreError::Network { operation, message } => {
                write!(f, "remote {} failed (network): {}", operation, message)
            }
            RemoteStoreError::Protocol { operation, message } => {
                write!(f, "remote {} rejected: {}", operation, message)
            }
        }
    }
}

impl std::error::Error for RemoteStoreError {}

/// Remote chunked-upload store.
pub trait RemoteStore: Send + Sync {
    /// Open a resumable session seeded with the first chunk's bytes.
    fn start_session(&self, first_chunk: &[u8]) -> Result<String, RemoteStoreError>;

    /// Append bytes at `offset`, which must equal the total bytes the
    /// session has already accepted.
    fn append_to_session(
        &self,
        session_id: &str,
        bytes: &[u8],
        offset: u64,
    ) -> Result<(), RemoteStoreError>;

    /// Append the final bytes and commit the session to `destination_path`.
    fn finish_session(
        &self,
        session_id: &str,
        final_bytes: &[u8],
        offset: u64,
        destination_path: &str,
    ) -> Result<(), RemoteStoreError>;

    /// Single-shot upload for files that are one chunk long.
    fn upload_whole(&self, bytes: &[u8], destination_path: &str) -> Result<(), RemoteStoreError>;
}

/// Build a store from a configured URL. `stub://` yields the in-memory
/// store (tests, dry runs); `http(s)://` yields the HTTP client.
pub fn open_store(url: &str, token: &str, timeout: Duration) -> Result<Arc<dyn RemoteStore>> {
    if url.starts_with("stub://") {
        Ok(Arc::new(MemoryRemoteStore::new()))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(HttpRemoteStore::new(url, token, timeout)))
    } else {
        Err(anyhow!(
            "unsupported remote store url '{}'; expected stub:// or http(s)://",
            url
        ))
    }
}

// ----------------------------------------------------------------------------
// HTTP client
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    session_id: String,
}

/// HTTP implementation of the chunked-upload protocol.
pub struct HttpRemoteStore {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::builder().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn post(
        &self,
        operation: &'static str,
        path_and_query: &str,
        body: &[u8],
    ) -> Result<ureq::Response, RemoteStoreError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let result = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", "application/octet-stream")
            .send_bytes(body);
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, response)) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| String::from("<unreadable body>"));
                // 5xx and 429 are the server's problem or backpressure;
                // anything else in 4xx means we sent something invalid.
                if code >= 500 || code == 429 {
                    Err(RemoteStoreError::network(
                        operation,
                        format!("status {}: {}", code, message),
                    ))
                } else {
                    Err(RemoteStoreError::protocol(
                        operation,
                        format!("status {}: {}", code, message),
                    ))
                }
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(RemoteStoreError::network(operation, transport.to_string()))
            }
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    fn start_session(&self, first_chunk: &[u8]) -> Result<String, RemoteStoreError> {
        let response = self.post("start_session", "/upload_session/start", first_chunk)?;
        let body = response
            .into_string()
            .map_err(|e| RemoteStoreError::network("start_session", e.to_string()))?;
        let parsed: StartSessionResponse = serde_json::from_str(&body).map_err(|e| {
            RemoteStoreError::protocol("start_session", format!("invalid response: {}", e))
        })?;
        Ok(parsed.session_id)
    }

    fn append_to_session(
        &self,
        session_id: &str,
        bytes: &[u8],
        offset: u64,
    ) -> Result<(), RemoteStoreError> {
        let query = format!(
            "/upload_session/append?session_id={}&offset={}",
            session_id, offset
        );
        self.post("append_to_session", &query, bytes)?;
        Ok(())
    }

    fn finish_session(
        &self,
        session_id: &str,
        final_bytes: &[u8],
        offset: u64,
        destination_path: &str,
    ) -> Result<(), RemoteStoreError> {
        let query = format!(
            "/upload_session/finish?session_id={}&offset={}&path={}",
            session_id, offset, destination_path
        );
        self.post("finish_session", &query, final_bytes)?;
        Ok(())
    }

    fn upload_whole(&self, bytes: &[u8], destination_path: &str) -> Result<(), RemoteStoreError> {
        let query = format!("/upload?path={}", destination_path);
        self.post("upload_whole", &query, bytes)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    next_session: u64,
    sessions: HashMap<String, Vec<u8>>,
    files: HashMap<String, Vec<u8>>,
    injected_failures: u32,
    nonempty_payloads: u32,
}

/// In-memory store with the same offset discipline as the real protocol.
/// Serves `stub://` URLs and the test suite; can inject a burst of
/// network failures to exercise retry paths.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a network error.
    pub fn inject_failures(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.injected_failures = count;
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.files.get(path).cloned())
    }

    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .state
            .lock()
            .map(|state| state.files.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    pub fn open_session_count(&self) -> usize {
        self.state.lock().map(|state| state.sessions.len()).unwrap_or(0)
    }

    /// Number of calls that carried a non-empty payload; equals the number
    /// of data-bearing chunks the store has accepted.
    pub fn nonempty_payload_count(&self) -> u32 {
        self.state
            .lock()
            .map(|state| state.nonempty_payloads)
            .unwrap_or(0)
    }

    fn count_payload(state: &mut MemoryState, bytes: &[u8]) {
        if !bytes.is_empty() {
            state.nonempty_payloads += 1;
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, RemoteStoreError> {
        self.state
            .lock()
            .map_err(|_| RemoteStoreError::protocol("memory_store", "state lock poisoned"))
    }

    fn check_injected(
        state: &mut MemoryState,
        operation: &'static str,
    ) -> Result<(), RemoteStoreError> {
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(RemoteStoreError::network(operation, "injected failure"));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn start_session(&self, first_chunk: &[u8]) -> Result<String, RemoteStoreError> {
        let mut state = self.locked()?;
        Self::check_injected(&mut state, "start_session")?;
        Self::count_payload(&mut state, first_chunk);
        let id = format!("session-{}", state.next_session);
        state.next_session += 1;
        state.sessions.insert(id.clone(), first_chunk.to_vec());
        Ok(id)
    }

    fn append_to_session(
        &self,
        session_id: &str,
        bytes: &[u8],
        offset: u64,
    ) -> Result<(), RemoteStoreError> {
        let mut state = self.locked()?;
        Self::check_injected(&mut state, "append_to_session")?;
        Self::count_payload(&mut state, bytes);
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RemoteStoreError::protocol("append_to_session", "unknown session"))?;
        if session.len() as u64 != offset {
            return Err(RemoteStoreError::protocol(
                "append_to_session",
                format!("offset {} does not match session length {}", offset, session.len()),
            ));
        }
        session.extend_from_slice(bytes);
        Ok(())
    }

    fn finish_session(
        &self,
        session_id: &str,
        final_bytes: &[u8],
        offset: u64,
        destination_path: &str,
    ) -> Result<(), RemoteStoreError> {
        let mut state = self.locked()?;
        Self::check_injected(&mut state, "finish_session")?;
        Self::count_payload(&mut state, final_bytes);
        let mut session = state
            .sessions
            .remove(session_id)
            .ok_or_else(|| RemoteStoreError::protocol("finish_session", "unknown session"))?;
        if session.len() as u64 != offset {
            // Put it back so the mismatch is observable, then reject.
            let len = session.len();
            state.sessions.insert(session_id.to_string(), session);
            return Err(RemoteStoreError::protocol(
                "finish_session",
                format!("offset {} does not match session length {}", offset, len),
            ));
        }
        session.extend_from_slice(final_bytes);
        state.files.insert(destination_path.to_string(), session);
        Ok(())
    }

    fn upload_whole(&self, bytes: &[u8], destination_path: &str) -> Result<(), RemoteStoreError> {
        let mut state = self.locked()?;
        Self::check_injected(&mut state, "upload_whole")?;
        Self::count_payload(&mut state, bytes);
        state
            .files
            .insert(destination_path.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_builds_file_from_session() {
        let store = MemoryRemoteStore::new();
        let id = store.start_session(b"aaa").unwrap();
        store.append_to_session(&id, b"bbb", 3).unwrap();
        store.finish_session(&id, b"cc", 6, "cam/clip.h264").unwrap();
        assert_eq!(store.file("cam/clip.h264").unwrap(), b"aaabbbcc");
        assert_eq!(store.open_session_count(), 0);
    }

    #[test]
    fn memory_store_enforces_offsets() {
        let store = MemoryRemoteStore::new();
        let id = store.start_session(b"aaa").unwrap();
        let err = store.append_to_session(&id, b"bbb", 5).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn injected_failures_are_network_errors() {
        let store = MemoryRemoteStore::new();
        store.inject_failures(1);
        let err = store.upload_whole(b"x", "p").unwrap_err();
        assert!(err.is_retryable());
        store.upload_whole(b"x", "p").unwrap();
    }

    #[test]
    fn open_store_dispatches_on_scheme() {
        assert!(open_store("stub://recordings", "", Duration::from_secs(5)).is_ok());
        assert!(open_store("https://store.example/v1", "tok", Duration::from_secs(5)).is_ok());
        assert!(open_store("ftp://nope", "", Duration::from_secs(5)).is_err());
    }
}
