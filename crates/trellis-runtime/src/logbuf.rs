//! Bounded log ring with live fan-out.
//!
//! Each `Process` owns one `LogBuffer`: a thread-safe ring of the most
//! recent N lines, an optional parsed record alongside each raw line, and a
//! list of live subscribers fed without ever blocking the writer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use trellis_core::ports::{LogDeriver, LogEntry, LogParser};

/// Capacity of each subscriber's channel. A subscriber whose channel is full
/// misses lines rather than stalling the producer.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// Lines longer than this are cut at the boundary, marker appended.
const MAX_LINE_BYTES: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = " [truncated]";

/// One update delivered to live subscribers.
#[derive(Debug, Clone)]
pub struct LogUpdate {
    pub line: String,
    /// Monotonic write sequence number for this buffer.
    pub seq: u64,
    pub parsed: Option<Arc<LogEntry>>,
}

/// Handle returned by `subscribe`; dropping the receiver without
/// unsubscribing leaks one slot until the buffer is closed or replaced.
pub struct LogSubscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<LogUpdate>,
}

struct Slot {
    raw: String,
    parsed: Option<Arc<LogEntry>>,
}

struct Ring {
    slots: VecDeque<Slot>,
    capacity: usize,
    seq: u64,
    parser: Option<Arc<dyn LogParser>>,
    deriver: Option<Arc<dyn LogDeriver>>,
}

/// Thread-safe bounded ring of recent log lines with live subscriptions.
///
/// The ring sits under one mutex; the subscriber list under a separate
/// read-write lock because reads dominate. Sends to subscribers happen
/// outside the ring lock to keep writes fast.
pub struct LogBuffer {
    ring: Mutex<Ring>,
    subscribers: RwLock<Vec<(u64, mpsc::Sender<LogUpdate>)>>,
    next_subscriber_id: AtomicU64,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                seq: 0,
                parser: None,
                deriver: None,
            }),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Install or replace the parser and deriver. Subsequent writes use
    /// them; previously stored entries are untouched.
    pub fn set_parser(
        &self,
        parser: Option<Arc<dyn LogParser>>,
        deriver: Option<Arc<dyn LogDeriver>>,
    ) {
        let mut ring = self.ring.lock().unwrap();
        ring.parser = parser;
        ring.deriver = deriver;
    }

    /// Append one line. Never fails: a parse error just leaves the parsed
    /// slot empty, the raw line is stored regardless.
    pub fn write(&self, line: &str) {
        let line = truncate_line(line);

        let (seq, parsed) = {
            let mut ring = self.ring.lock().unwrap();
            let parsed = ring.parser.as_ref().and_then(|p| p.parse(&line)).map(|mut entry| {
                if let Some(deriver) = ring.deriver.as_ref() {
                    deriver.apply(&mut entry);
                }
                Arc::new(entry)
            });
            if ring.slots.len() >= ring.capacity {
                ring.slots.pop_front();
            }
            ring.slots.push_back(Slot {
                raw: line.clone(),
                parsed: parsed.clone(),
            });
            ring.seq += 1;
            (ring.seq, parsed)
        };

        // Snapshot under the read lock, send outside any lock. A full
        // channel drops the update for that subscriber only.
        let senders: Vec<mpsc::Sender<LogUpdate>> = {
            let subscribers = self.subscribers.read().unwrap();
            subscribers.iter().map(|(_, tx)| tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.try_send(LogUpdate {
                line: line.clone(),
                seq,
                parsed: parsed.clone(),
            });
        }
    }

    /// Split `text` on newlines and append each line. A single trailing
    /// empty segment from a terminal newline is trimmed; interior empty
    /// lines are preserved.
    pub fn write_lines(&self, text: &str) {
        let mut segments: Vec<&str> = text.split('\n').collect();
        if segments.last() == Some(&"") {
            segments.pop();
        }
        for segment in segments {
            self.write(segment.strip_suffix('\r').unwrap_or(segment));
        }
    }

    /// Last `min(n, size)` raw lines in chronological order.
    #[must_use]
    pub fn lines(&self, n: usize) -> Vec<String> {
        let ring = self.ring.lock().unwrap();
        let skip = ring.slots.len().saturating_sub(n);
        ring.slots.iter().skip(skip).map(|s| s.raw.clone()).collect()
    }

    /// Parsed counterpart of `lines`; unparsed lines yield `None`.
    #[must_use]
    pub fn entries(&self, n: usize) -> Vec<Option<Arc<LogEntry>>> {
        let ring = self.ring.lock().unwrap();
        let skip = ring.slots.len().saturating_sub(n);
        ring.slots.iter().skip(skip).map(|s| s.parsed.clone()).collect()
    }

    /// Number of lines currently held.
    #[must_use]
    pub fn size(&self) -> usize {
        self.ring.lock().unwrap().slots.len()
    }

    /// Total writes since creation. Strictly increasing, survives `clear`.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.ring.lock().unwrap().seq
    }

    /// Register a new live subscriber.
    #[must_use]
    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().push((id, tx));
        LogSubscription { id, receiver: rx }
    }

    /// Deregister a subscriber and close its channel.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Close and discard every subscriber channel. Used when the owning
    /// process is being replaced so readers exit their loops cleanly.
    pub fn close_all_subscribers(&self) {
        self.subscribers.write().unwrap().clear();
    }

    /// Drop all stored lines. The sequence counter keeps its value.
    pub fn clear(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.slots.clear();
    }
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LINE_BYTES {
        return line.to_string();
    }
    let mut cut = MAX_LINE_BYTES;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = line[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PrefixParser;

    impl LogParser for PrefixParser {
        fn parse(&self, line: &str) -> Option<LogEntry> {
            line.strip_prefix("ok ").map(|msg| LogEntry {
                message: msg.to_string(),
                raw: line.to_string(),
                ..LogEntry::default()
            })
        }
    }

    #[test]
    fn ring_keeps_last_n_in_order() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.write(&format!("line-{i}"));
        }
        assert_eq!(buf.size(), 3);
        assert_eq!(buf.seq(), 5);
        assert_eq!(buf.lines(10), vec!["line-2", "line-3", "line-4"]);
        assert_eq!(buf.lines(2), vec!["line-3", "line-4"]);
    }

    #[test]
    fn lines_on_empty_buffer_is_empty() {
        let buf = LogBuffer::new(4);
        assert!(buf.lines(10).is_empty());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn write_lines_trims_single_trailing_newline_only() {
        let buf = LogBuffer::new(10);
        buf.write_lines("a\n\nb\n");
        assert_eq!(buf.lines(10), vec!["a", "", "b"]);
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let buf = LogBuffer::new(10);
        buf.write_lines("a\r\nb\r\n");
        assert_eq!(buf.lines(10), vec!["a", "b"]);
    }

    #[test]
    fn parse_failures_store_raw_with_empty_parsed_slot() {
        let buf = LogBuffer::new(10);
        buf.set_parser(Some(Arc::new(PrefixParser)), None);
        buf.write("ok hello");
        buf.write("garbage");
        let entries = buf.entries(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].as_ref().unwrap().message, "hello");
        assert!(entries[1].is_none());
        assert_eq!(buf.lines(10), vec!["ok hello", "garbage"]);
    }

    #[test]
    fn oversized_lines_are_truncated_with_marker() {
        let buf = LogBuffer::new(2);
        let long = "x".repeat(MAX_LINE_BYTES + 10);
        buf.write(&long);
        let stored = &buf.lines(1)[0];
        assert!(stored.ends_with(TRUNCATION_MARKER));
        assert_eq!(stored.len(), MAX_LINE_BYTES + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn subscribers_receive_updates_in_order() {
        let buf = LogBuffer::new(10);
        let mut sub = buf.subscribe();
        buf.write("first");
        buf.write("second");
        let a = sub.receiver.recv().await.unwrap();
        let b = sub.receiver.recv().await.unwrap();
        assert_eq!(a.line, "first");
        assert_eq!(b.line, "second");
        assert!(a.seq < b.seq);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_lines_without_blocking_writer() {
        let buf = LogBuffer::new(500);
        let mut sub = buf.subscribe();
        for i in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 50) {
            buf.write(&format!("line-{i}"));
        }
        // Writer was never blocked; the channel holds only its capacity.
        let mut received = 0;
        while sub.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_CHANNEL_CAPACITY);
        assert_eq!(buf.size(), SUBSCRIBER_CHANNEL_CAPACITY + 50);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let buf = LogBuffer::new(10);
        let mut sub = buf.subscribe();
        buf.unsubscribe(sub.id);
        buf.write("after");
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_all_subscribers_releases_every_reader() {
        let buf = LogBuffer::new(10);
        let mut one = buf.subscribe();
        let mut two = buf.subscribe();
        buf.close_all_subscribers();
        assert!(one.receiver.recv().await.is_none());
        assert!(two.receiver.recv().await.is_none());
    }

    #[test]
    fn clear_resets_contents_but_not_seq() {
        let buf = LogBuffer::new(4);
        buf.write("a");
        buf.write("b");
        buf.clear();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.seq(), 2);
        buf.write("c");
        assert_eq!(buf.lines(10), vec!["c"]);
        assert_eq!(buf.seq(), 3);
    }
}
