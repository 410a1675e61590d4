//! Live command output fan-out
//!
//! Every connected browser gets its own bounded queue, so one slow viewer cannot stall a
//! command or interleave with another viewer's stream.

use std::io::{self, Write};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, warn};
use parking_lot::Mutex;

/// Chunks queued per subscriber before new chunks are dropped for it
const SUBSCRIBER_QUEUE: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct LiveHub {
    subscribers: Arc<Mutex<Vec<Sender<String>>>>,
}

impl LiveHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new viewer. Output published from now on is queued for it
    /// until the receiver is dropped.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE);
        let mut subscribers = self.subscribers.lock();
        subscribers.push(tx);
        debug!("Live output subscriber added ({} total)", subscribers.len());
        rx
    }

    /// Send a chunk to every viewer, forgetting viewers that went away
    pub fn publish(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(chunk.to_string()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Live output subscriber is lagging, dropping a chunk");
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Live output subscriber disconnected");
                    false
                }
            });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Output sink handed to runners: keeps a copy for the response and forwards
/// each write to the live hub as it happens.
pub struct TeeSink<'a> {
    captured: Vec<u8>,
    live: Option<&'a LiveHub>,
}

impl<'a> TeeSink<'a> {
    #[must_use]
    pub fn new(live: Option<&'a LiveHub>) -> Self {
        TeeSink {
            captured: Vec::new(),
            live,
        }
    }

    #[must_use]
    pub fn into_output(self) -> String {
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

impl Write for TeeSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.captured.extend_from_slice(buf);
        if let Some(live) = self.live {
            live.publish(&String::from_utf8_lossy(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_subscriber_gets_every_chunk() {
        let hub = LiveHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        hub.publish("one");
        hub.publish("two");
        assert_eq!(a.try_iter().collect::<Vec<_>>(), ["one", "two"]);
        assert_eq!(b.try_iter().collect::<Vec<_>>(), ["one", "two"]);
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let hub = LiveHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);
        hub.publish("x");
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), "x");
    }

    #[test]
    fn test_full_subscriber_is_kept() {
        let hub = LiveHub::new();
        let rx = hub.subscribe();
        for i in 0..=SUBSCRIBER_QUEUE {
            hub.publish(&i.to_string());
        }
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(rx.len(), SUBSCRIBER_QUEUE);
    }

    #[test]
    fn test_tee_sink_captures_and_publishes() {
        let hub = LiveHub::new();
        let rx = hub.subscribe();
        let mut sink = TeeSink::new(Some(&hub));
        write!(sink, "5 + 7 = ").unwrap();
        writeln!(sink, "12").unwrap();
        assert_eq!(sink.into_output(), "5 + 7 = 12\n");
        assert_eq!(rx.try_iter().collect::<String>(), "5 + 7 = 12\n");
    }
}
