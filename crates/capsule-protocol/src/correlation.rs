//! Pending-request table matching RESULT/ERROR responses to their requests.
//!
//! Ids are allocated monotonically from 1 and never reused on a table. A call
//! given up locally (timeout, cancelled future) is marked abandoned so its late
//! LOG and RESULT/ERROR messages are dropped instead of being reported as
//! unmatched.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::envelope::LogPayload;
use crate::error::ProtocolError;

/// What a waiting caller receives: the outcome plus every LOG line that arrived
/// for the request, in arrival order.
#[derive(Debug)]
pub struct Completion<T> {
    pub outcome: T,
    pub logs: Vec<LogPayload>,
}

struct Entry<T> {
    target: String,
    logs: Vec<LogPayload>,
    tx: oneshot::Sender<Completion<T>>,
}

struct Inner<T> {
    next_id: u64,
    pending: HashMap<u64, Entry<T>>,
    abandoned: HashSet<u64>,
}

/// Correlation table for one channel.
pub struct PendingCalls<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingCalls<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
                abandoned: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // Entries hold no invariants a panicking holder could break halfway.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh id for a request to `target`.
    pub fn register(&self, target: impl Into<String>) -> (u64, oneshot::Receiver<Completion<T>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.insert(
            id,
            Entry {
                target: target.into(),
                logs: Vec::new(),
                tx,
            },
        );
        (id, rx)
    }

    /// Attach a LOG line to its pending request.
    pub fn append_log(&self, id: u64, log: LogPayload) -> Result<(), ProtocolError> {
        let mut inner = self.lock();
        if let Some(entry) = inner.pending.get_mut(&id) {
            entry.logs.push(log);
            return Ok(());
        }
        if inner.abandoned.contains(&id) {
            return Ok(());
        }
        Err(ProtocolError::UnmatchedId(id))
    }

    /// Complete a pending request.
    pub fn resolve(&self, id: u64, outcome: T) -> Result<(), ProtocolError> {
        let entry = {
            let mut inner = self.lock();
            match inner.pending.remove(&id) {
                Some(entry) => entry,
                None if inner.abandoned.remove(&id) => {
                    log::debug!("[protocol] Dropping late response for abandoned request {}", id);
                    return Ok(());
                }
                None => return Err(ProtocolError::UnmatchedId(id)),
            }
        };
        let completion = Completion {
            outcome,
            logs: entry.logs,
        };
        if entry.tx.send(completion).is_err() {
            log::debug!(
                "[protocol] Caller for request {} ({}) went away before its response",
                id,
                entry.target
            );
        }
        Ok(())
    }

    /// Give up on a request locally. Its late messages will be discarded.
    pub fn abandon(&self, id: u64) {
        let mut inner = self.lock();
        if inner.pending.remove(&id).is_some() {
            inner.abandoned.insert(id);
        }
    }

    /// Complete every pending request with an outcome built by `outcome`.
    /// Returns how many requests were failed.
    pub fn fail_all(&self, mut outcome: impl FnMut(u64, &str) -> T) -> usize {
        let drained: Vec<(u64, Entry<T>)> = {
            let mut inner = self.lock();
            inner.abandoned.clear();
            inner.pending.drain().collect()
        };
        let count = drained.len();
        for (id, entry) in drained {
            let completion = Completion {
                outcome: outcome(id, &entry.target),
                logs: entry.logs,
            };
            let _ = entry.tx.send(completion);
        }
        count
    }

    /// Target name of a pending request.
    pub fn target(&self, id: u64) -> Option<String> {
        self.lock().pending.get(&id).map(|e| e.target.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::LogStream;

    fn line(text: &str) -> LogPayload {
        LogPayload {
            stream: LogStream::Stdout,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let pending: PendingCalls<i32> = PendingCalls::new();
        let (a, _ra) = pending.register("m.a");
        let (b, _rb) = pending.register("m.b");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        pending.resolve(a, 0).unwrap();
        let (c, _rc) = pending.register("m.c");
        assert_eq!(c, 3);
    }

    #[tokio::test]
    async fn test_resolve_delivers_logs_in_order() {
        let pending: PendingCalls<&'static str> = PendingCalls::new();
        let (id, rx) = pending.register("m.chatter");
        assert_eq!(pending.target(id).as_deref(), Some("m.chatter"));

        pending.append_log(id, line("one")).unwrap();
        pending.append_log(id, line("two")).unwrap();
        pending.resolve(id, "done").unwrap();

        let completion = rx.await.unwrap();
        assert_eq!(completion.outcome, "done");
        let texts: Vec<_> = completion.logs.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unmatched_id() {
        let pending: PendingCalls<()> = PendingCalls::new();
        assert!(matches!(
            pending.resolve(42, ()),
            Err(ProtocolError::UnmatchedId(42))
        ));
        assert!(matches!(
            pending.append_log(42, line("x")),
            Err(ProtocolError::UnmatchedId(42))
        ));
    }

    #[test]
    fn test_response_resolves_only_once() {
        let pending: PendingCalls<()> = PendingCalls::new();
        let (id, _rx) = pending.register("m.f");
        pending.resolve(id, ()).unwrap();
        assert!(pending.resolve(id, ()).is_err());
    }

    #[test]
    fn test_abandoned_late_response_is_quiet() {
        let pending: PendingCalls<()> = PendingCalls::new();
        let (id, rx) = pending.register("demo.sleep");
        drop(rx);
        pending.abandon(id);
        assert!(pending.is_empty());

        pending.append_log(id, line("late")).unwrap();
        pending.resolve(id, ()).unwrap();
        // Only the first late response is absorbed.
        assert!(pending.resolve(id, ()).is_err());
    }

    #[test]
    fn test_fail_all_forgets_abandoned() {
        let pending: PendingCalls<()> = PendingCalls::new();
        let (id, _rx) = pending.register("demo.sleep");
        pending.abandon(id);
        pending.fail_all(|_, _| ());
        assert!(matches!(
            pending.resolve(id, ()),
            Err(ProtocolError::UnmatchedId(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending: PendingCalls<String> = PendingCalls::new();
        let (_a, ra) = pending.register("m.a");
        let (_b, rb) = pending.register("m.b");

        let failed = pending.fail_all(|id, target| format!("crashed {} {}", id, target));
        assert_eq!(failed, 2);
        assert!(pending.is_empty());

        assert_eq!(ra.await.unwrap().outcome, "crashed 1 m.a");
        assert_eq!(rb.await.unwrap().outcome, "crashed 2 m.b");
    }
}
