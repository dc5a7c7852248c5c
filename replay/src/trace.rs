//! Debug trace sinks
//!
//! With `debug_trace` enabled every byte written to and read from the
//! destination is handed to a [`TraceSink`], tagged with the id of the
//! `send` call it belongs to so interleaved concurrent calls stay apart.

use std::fmt;
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request bytes written to the destination
    Outbound,
    /// Response bytes read back
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str(">>>"),
            Direction::Inbound => f.write_str("<<<"),
        }
    }
}

/// Receiver of mirrored request/response bytes
pub trait TraceSink: Send + Sync {
    fn record(&self, call: u64, direction: Direction, data: &[u8]);
}

/// Writes traces through `tracing` at DEBUG level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&self, call: u64, direction: Direction, data: &[u8]) {
        debug!(
            target: "httpreplay::trace",
            call,
            bytes = data.len(),
            "{} {}",
            direction,
            String::from_utf8_lossy(data)
        );
    }
}

/// A single mirrored transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub call: u64,
    pub direction: Direction,
    pub data: Vec<u8>,
}

/// Keeps traces in memory, in the order they were recorded
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<TraceEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TraceSink for MemorySink {
    fn record(&self, call: u64, direction: Direction, data: &[u8]) {
        let event = TraceEvent { call, direction, data: data.to_vec() };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.record(1, Direction::Outbound, b"GET / HTTP/1.1\r\n\r\n");
        sink.record(2, Direction::Outbound, b"GET /b HTTP/1.1\r\n\r\n");
        sink.record(1, Direction::Inbound, b"HTTP/1.1 200 OK\r\n\r\n");

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].call, 1);
        assert_eq!(events[2].direction, Direction::Inbound);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Outbound.to_string(), ">>>");
        assert_eq!(Direction::Inbound.to_string(), "<<<");
    }
}
