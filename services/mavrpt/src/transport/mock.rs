//! Mock Transport Implementation
//!
//! Controllable in-memory transport for relay engine tests. Clones share the
//! same state, so a test keeps one clone to inject data and inspect writes
//! while the engine owns the other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::traits::{Transport, TransportError, TransportStats};

#[derive(Debug, Default)]
struct MockState {
    inbound: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    written: Mutex<Vec<Vec<u8>>>,
    write_failures: Mutex<VecDeque<TransportError>>,
    readiness_failure: Mutex<Option<TransportError>>,
    /// Report readable even with nothing queued
    always_ready: AtomicBool,
    /// Readable forever, reads hit end-of-file once the queue is empty
    hung_up: AtomicBool,
    closed: AtomicBool,
    close_calls: Mutex<u32>,
    inbound_ready: Notify,
    stats: Mutex<TransportStats>,
}

/// Mock transport for testing
#[derive(Debug, Clone)]
pub struct MockTransport {
    name: &'static str,
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(MockState::default()),
        }
    }

    /// Queue a chunk for the next read
    pub fn push_inbound(&self, data: &[u8]) {
        self.state.inbound.lock().push_back(Ok(data.to_vec()));
        self.state.inbound_ready.notify_one();
    }

    /// Queue a failing read
    pub fn push_read_error(&self, err: TransportError) {
        self.state.inbound.lock().push_back(Err(err));
        self.state.inbound_ready.notify_one();
    }

    /// Fail the next write with `err`
    pub fn fail_next_write(&self, err: TransportError) {
        self.state.write_failures.lock().push_back(err);
    }

    /// Make every readiness wait fail with `err`
    pub fn fail_readiness(&self, err: TransportError) {
        *self.state.readiness_failure.lock() = Some(err);
        self.state.inbound_ready.notify_one();
    }

    pub fn set_always_ready(&self, ready: bool) {
        self.state.always_ready.store(ready, Ordering::SeqCst);
        self.state.inbound_ready.notify_one();
    }

    /// Behave like a tty whose other end went away
    pub fn hang_up(&self) {
        self.state.hung_up.store(true, Ordering::SeqCst);
        self.state.inbound_ready.notify_one();
    }

    /// Chunks written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.written.lock().clone()
    }

    pub fn close_calls(&self) -> u32 {
        *self.state.close_calls.lock()
    }

    /// Wait until at least `count` chunks were written
    pub async fn wait_for_writes(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.state.written.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.state.written.lock().len() >= count
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        self.name
    }

    async fn readable(&self) -> Result<(), TransportError> {
        loop {
            // Registered before the checks so a push in between is not missed
            let notified = self.state.inbound_ready.notified();

            if self.state.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ResourceClosed);
            }
            if let Some(err) = self.state.readiness_failure.lock().clone() {
                return Err(err);
            }
            if self.state.always_ready.load(Ordering::SeqCst)
                || self.state.hung_up.load(Ordering::SeqCst)
                || !self.state.inbound.lock().is_empty()
            {
                return Ok(());
            }

            notified.await;
        }
    }

    fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed);
        }
        let next = self.state.inbound.lock().pop_front();
        let result = match next {
            Some(Ok(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            },
            Some(Err(err)) => Err(err),
            None if self.state.hung_up.load(Ordering::SeqCst) => Ok(0),
            None => Err(TransportError::WouldBlock),
        };

        let mut stats = self.state.stats.lock();
        match &result {
            Ok(n) => stats.record_received(*n),
            Err(e) => stats.record_error(e),
        }
        result
    }

    fn write_chunk(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed);
        }
        let result = match self.state.write_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => {
                self.state.written.lock().push(data.to_vec());
                Ok(data.len())
            },
        };

        let mut stats = self.state.stats.lock();
        match &result {
            Ok(n) => stats.record_sent(*n),
            Err(e) => stats.record_error(e),
        }
        result
    }

    fn close(&mut self) {
        *self.state.close_calls.lock() += 1;
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.state.stats.lock().clone()
    }
}
