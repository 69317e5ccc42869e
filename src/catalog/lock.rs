use tonic::Streaming;

use crate::proto::catalog::LockResponse;

/// Exclusive claim on one job. The catalog holds the lock for as long as the
/// keep-alive stream stays open, so dropping the guard releases it.
pub struct LockGuard {
    lock_id: String,
    fencing_token: i64,
    // Keeps the keep-alive stream open; closing it is the release.
    _stream: Streaming<LockResponse>,
}

impl LockGuard {
    pub(crate) fn new(lock_id: String, fencing_token: i64, stream: Streaming<LockResponse>) -> Self {
        Self {
            lock_id,
            fencing_token,
            _stream: stream,
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Token from the acquisition message. Diagnostic only; the catalog does
    /// its own fencing of stale holders.
    pub fn fencing_token(&self) -> i64 {
        self.fencing_token
    }

    /// Releases the lock. Dropping the guard has the same effect; this only
    /// names the point of release.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::debug!(lock_id = %self.lock_id, "releasing job lock");
    }
}
