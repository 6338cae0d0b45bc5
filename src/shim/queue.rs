//! Streaming-queue request tracking.
//!
//! Non-blocking queue reads and writes are recorded here before the
//! transfer is issued; blocking requests never enter the tracker. A
//! recorded request leaves the outstanding set only when a completion
//! poll reports a non-zero transferred byte count for it, and it is
//! reported back exactly once, with the caller's original context.

use std::collections::BTreeMap;

/// A non-blocking request awaiting completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    /// Monotonically increasing per-session request id.
    pub id: u64,
    /// Opaque caller context returned with the completion.
    pub context: usize,
    /// Host buffer address to requested length, per request buffer.
    pub spans: BTreeMap<u64, u64>,
}

/// One satisfied request as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub context: usize,
    /// Bytes the simulator reports transferred.
    pub bytes: u64,
}

/// Outstanding-request correlation for one device session.
#[derive(Debug, Default)]
pub struct QueueTracker {
    outstanding: Vec<OutstandingRequest>,
    next_request_id: u64,
}

impl QueueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the id for the next queue request. Every queue request
    /// consumes an id, blocking or not.
    pub fn begin_request(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Record a non-blocking request before its transfer is issued.
    pub fn record(&mut self, id: u64, context: usize, spans: BTreeMap<u64, u64>) {
        self.outstanding.push(OutstandingRequest { id, context, spans });
    }

    pub fn outstanding(&self) -> &[OutstandingRequest] {
        &self.outstanding
    }

    /// Run one pass over the outstanding set.
    ///
    /// `probe` reports the transferred byte count for one request; a
    /// non-zero count completes the request and removes it. At most
    /// `limit` completions are collected; requests beyond the limit are
    /// not probed and stay outstanding for the next pass.
    pub fn poll_pass<E>(
        &mut self,
        limit: usize,
        mut probe: impl FnMut(&OutstandingRequest) -> Result<u64, E>,
    ) -> Result<Vec<Completion>, E> {
        let mut completed = Vec::new();
        let mut index = 0;
        while index < self.outstanding.len() && completed.len() < limit {
            let bytes = probe(&self.outstanding[index])?;
            if bytes > 0 {
                let request = self.outstanding.remove(index);
                completed.push(Completion { context: request.context, bytes });
            } else {
                index += 1;
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(entries: &[(u64, u64)]) -> BTreeMap<u64, u64> {
        entries.iter().copied().collect()
    }

    #[test]
    fn request_ids_increase_monotonically() {
        let mut tracker = QueueTracker::new();
        assert_eq!(tracker.begin_request(), 0);
        assert_eq!(tracker.begin_request(), 1);
        assert_eq!(tracker.begin_request(), 2);
    }

    #[test]
    fn zero_byte_reports_leave_requests_outstanding() {
        let mut tracker = QueueTracker::new();
        let id = tracker.begin_request();
        tracker.record(id, 0xCAFE, spans(&[(0x1000, 64)]));

        let done: Vec<Completion> = tracker.poll_pass::<()>(16, |_| Ok(0)).unwrap();
        assert!(done.is_empty());
        assert_eq!(tracker.outstanding().len(), 1);
    }

    #[test]
    fn completed_requests_are_removed_exactly_once() {
        let mut tracker = QueueTracker::new();
        for context in 0..3usize {
            let id = tracker.begin_request();
            tracker.record(id, context, spans(&[(0x1000 * context as u64, 64)]));
        }

        // Complete only request id 1 on this pass.
        let done = tracker
            .poll_pass::<()>(16, |req| Ok(if req.id == 1 { 64 } else { 0 }))
            .unwrap();
        assert_eq!(done, vec![Completion { context: 1, bytes: 64 }]);
        assert_eq!(tracker.outstanding().len(), 2);

        // A second pass does not see the completed request again.
        let done = tracker
            .poll_pass::<()>(16, |req| Ok(if req.id == 1 { 64 } else { 0 }))
            .unwrap();
        assert!(done.is_empty());
    }

    #[test]
    fn completion_limit_leaves_the_rest_outstanding() {
        let mut tracker = QueueTracker::new();
        for context in 0..4usize {
            let id = tracker.begin_request();
            tracker.record(id, context, spans(&[(context as u64, 8)]));
        }

        let done = tracker.poll_pass::<()>(2, |_| Ok(8)).unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(tracker.outstanding().len(), 2);
        // Contexts report in recording order.
        assert_eq!(done[0].context, 0);
        assert_eq!(done[1].context, 1);
    }

    #[test]
    fn probe_errors_propagate_and_keep_requests() {
        let mut tracker = QueueTracker::new();
        let id = tracker.begin_request();
        tracker.record(id, 7, spans(&[(0, 8)]));

        let result = tracker.poll_pass(16, |_| Err("channel down"));
        assert_eq!(result, Err("channel down"));
        assert_eq!(tracker.outstanding().len(), 1);
    }
}
