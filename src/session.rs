use crate::reconstruct::TEMPORARY_FAILURE;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Ordered key/value pairs forwarded to rspamd as request headers.
///
/// Keys may repeat (one `Rcpt` per accepted recipient).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Replace every value recorded under `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_string(), value.into()));
    }

    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_string(), value.into()));
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[cfg(test)]
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn extend(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Write half of a pending verdict, owned by the scan task.
#[derive(Debug)]
pub struct VerdictSender(oneshot::Sender<String>);

/// Read half of a pending verdict, owned by the session until commit.
///
/// Both halves are consumed by use, so a verdict is written at most once and
/// read at most once.
#[derive(Debug)]
pub struct PendingVerdict(oneshot::Receiver<String>);

pub fn pending_verdict() -> (VerdictSender, PendingVerdict) {
    let (tx, rx) = oneshot::channel();
    (VerdictSender(tx), PendingVerdict(rx))
}

impl VerdictSender {
    pub fn resolve(self, reason: String) {
        if self.0.send(reason).is_err() {
            log::debug!("Verdict resolved after its session went away");
        }
    }
}

impl PendingVerdict {
    /// Wait for the rejection reason, empty meaning proceed.
    pub async fn wait(self) -> String {
        match self.0.await {
            Ok(reason) => reason,
            Err(_) => {
                // the scan task ended without resolving
                log::warn!("Scan task dropped its verdict");
                TEMPORARY_FAILURE.to_string()
            }
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: String,
    /// Connection-level metadata, kept until disconnect.
    link: Metadata,
    /// Per-transaction metadata, cleared when the transaction ends or the
    /// message body starts.
    transaction: Metadata,
    /// Snapshot of both metadata sets taken when the body starts.
    envelope: Option<Metadata>,
    /// Unstuffed message lines, kept as received.
    payload: Vec<u8>,
    pending: Option<PendingVerdict>,
}

impl Session {
    pub fn new(id: &str) -> Self {
        Session {
            id: id.to_string(),
            link: Metadata::default(),
            transaction: Metadata::default(),
            envelope: None,
            payload: Vec::new(),
            pending: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn link_mut(&mut self) -> &mut Metadata {
        &mut self.link
    }

    pub fn transaction_mut(&mut self) -> &mut Metadata {
        &mut self.transaction
    }

    /// All metadata recorded so far, connection-level entries first.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = self.link.clone();
        metadata.extend(&self.transaction);
        metadata
    }

    /// The body is about to stream: freeze the metadata for the scan request.
    pub fn begin_data(&mut self) {
        let envelope = self.metadata();
        self.transaction.clear();
        self.envelope = Some(envelope);
    }

    /// Transaction committed or rolled back.
    pub fn end_transaction(&mut self) {
        self.transaction.clear();
        self.envelope = None;
        self.payload.clear();
        if self.pending.take().is_some() {
            log::debug!("session {}: discarding unconsumed verdict", self.id);
        }
    }

    pub fn append_line(&mut self, line: &[u8]) {
        self.payload.extend_from_slice(line);
        self.payload.push(b'\n');
    }

    #[cfg(test)]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the envelope and payload for a scan, leaving the session ready
    /// for the next message.
    pub fn take_message(&mut self) -> (Metadata, Vec<u8>) {
        let envelope = match self.envelope.take() {
            Some(envelope) => envelope,
            None => self.metadata(),
        };
        (envelope, std::mem::take(&mut self.payload))
    }

    pub fn is_scanning(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_pending(&mut self, pending: PendingVerdict) {
        self.pending = Some(pending);
    }

    pub fn take_pending(&mut self) -> Option<PendingVerdict> {
        self.pending.take()
    }
}

/// Live sessions, owned by the control loop.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Start a fresh session, replacing any previous one with the same id.
    pub fn create(&mut self, id: &str) -> &mut Session {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                log::warn!("session {id}: connected twice, resetting state");
                entry.insert(Session::new(id));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(Session::new(id)),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_set_and_append() {
        let mut metadata = Metadata::default();
        metadata.set("From", "a@x");
        metadata.set("From", "c@z");
        metadata.append("Rcpt", "b@y");
        metadata.append("Rcpt", "d@w");

        assert_eq!(metadata.get("From"), Some("c@z"));
        assert_eq!(metadata.get_all("Rcpt").collect::<Vec<_>>(), ["b@y", "d@w"]);
        assert_eq!(metadata.iter().count(), 3);
    }

    #[test]
    fn test_begin_data_freezes_metadata() {
        let mut session = Session::new("s1");
        session.link_mut().set("Helo", "mx.example");
        session.transaction_mut().set("Queue-Id", "Q1");
        session.begin_data();

        session.append_line(b"Subject: hi");
        session.append_line(b"");
        session.append_line(b"caf\xe9");

        let (envelope, message) = session.take_message();
        assert_eq!(envelope.get("Helo"), Some("mx.example"));
        assert_eq!(envelope.get("Queue-Id"), Some("Q1"));
        assert_eq!(message, b"Subject: hi\n\ncaf\xe9\n");
        assert!(session.payload().is_empty());

        // Connection metadata survives for the next transaction
        let (next, _) = session.take_message();
        assert_eq!(next.get("Helo"), Some("mx.example"));
        assert_eq!(next.get("Queue-Id"), None);
    }

    #[test]
    fn test_end_transaction_resets() {
        let mut session = Session::new("s1");
        session.link_mut().set("Ip", "192.0.2.1");
        session.transaction_mut().set("From", "a@x");
        session.append_line(b"partial");
        let (_, pending) = pending_verdict();
        session.set_pending(pending);

        session.end_transaction();

        assert!(!session.is_scanning());
        assert!(session.payload().is_empty());
        let metadata = session.metadata();
        assert_eq!(metadata.get("Ip"), Some("192.0.2.1"));
        assert_eq!(metadata.get("From"), None);
    }

    #[test]
    fn test_registry_lifecycle() {
        let mut registry = SessionRegistry::new();
        registry.create("s1").append_line(b"stale");
        assert_eq!(registry.get("s1").unwrap().payload(), b"stale\n");

        // connect again replaces the entry
        registry.create("s1");
        assert!(registry.get("s1").unwrap().payload().is_empty());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("s1").is_some());
        assert!(registry.get_mut("s1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pending_verdict_resolves_once() {
        let (sender, pending) = pending_verdict();
        sender.resolve("421 greylisted".to_string());
        assert_eq!(pending.wait().await, "421 greylisted");
    }

    #[tokio::test]
    async fn test_dropped_sender_is_temporary_failure() {
        let (sender, pending) = pending_verdict();
        drop(sender);
        assert_eq!(pending.wait().await, TEMPORARY_FAILURE);
    }
}
