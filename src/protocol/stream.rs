//! Stream multiplexing
//!
//! A circuit multiplexes logical TCP-like streams, each identified by a
//! 16-bit id chosen by the client. This module is the per-circuit table:
//! id allocation, per-stream state, flow-control windows, and connect
//! deadlines. Cell traffic for streams is driven by the circuit.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::{Error, Result};

use super::exitrequest::ExitRequest;
use super::flow_control::StreamFlowControl;

pub type StreamId = u16;

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// BEGIN sent, waiting for CONNECTED.
    Opening,
    /// CONNECTED received; data may flow.
    Open,
    /// We sent END, waiting for the peer's END.
    HalfClosed,
    /// Fully closed; the entry is kept only until reaped.
    Closed,
}

/// Table entry for one stream.
#[derive(Debug)]
pub struct StreamEntry {
    pub state: StreamState,
    pub request: ExitRequest,
    pub flow: StreamFlowControl,
    /// Deadline for the CONNECTED reply while `Opening`.
    pub connect_deadline: Option<Instant>,
}

/// The per-circuit stream table.
#[derive(Debug, Default)]
pub struct StreamMap {
    streams: HashMap<StreamId, StreamEntry>,
    next_stream_id: StreamId,
    max_streams: usize,
}

impl StreamMap {
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1,
            max_streams,
        }
    }

    /// Allocate an id and insert a stream in `Opening` state. Ids count up
    /// from 1, skipping zero and ids still in use.
    pub fn allocate(
        &mut self,
        request: ExitRequest,
        connect_deadline: Option<Instant>,
    ) -> Result<StreamId> {
        if self.streams.len() >= self.max_streams {
            return Err(Error::ResourceExhausted(format!(
                "circuit already carries {} streams",
                self.streams.len()
            )));
        }

        let mut id = self.next_stream_id;
        loop {
            if id != 0 && !self.streams.contains_key(&id) {
                break;
            }
            id = id.wrapping_add(1);
        }
        self.next_stream_id = id.wrapping_add(1);
        if self.next_stream_id == 0 {
            self.next_stream_id = 1;
        }

        self.streams.insert(
            id,
            StreamEntry {
                state: StreamState::Opening,
                request,
                flow: StreamFlowControl::new(id),
                connect_deadline,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamEntry> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEntry> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().copied()
    }

    /// CONNECTED arrived for a stream.
    pub fn mark_connected(&mut self, id: StreamId) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| Error::Stream(format!("unknown stream id {}", id)))?;
        if entry.state != StreamState::Opening {
            return Err(Error::Stream(format!(
                "stream {} got CONNECTED while {:?}",
                id, entry.state
            )));
        }
        entry.state = StreamState::Open;
        entry.connect_deadline = None;
        Ok(())
    }

    /// We sent END: half-close, or reap if the peer already ended.
    pub fn mark_local_end(&mut self, id: StreamId) {
        if let Some(entry) = self.streams.get_mut(&id) {
            entry.state = match entry.state {
                StreamState::Closed => StreamState::Closed,
                _ => StreamState::HalfClosed,
            };
        }
    }

    /// The peer sent END. Removes the entry and reports whether the
    /// stream existed.
    pub fn mark_remote_end(&mut self, id: StreamId) -> bool {
        self.streams.remove(&id).is_some()
    }

    /// Remove every stream, returning the ids that were live. Used on
    /// circuit teardown to fail them upward.
    pub fn drain_all(&mut self) -> Vec<StreamId> {
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        self.streams.clear();
        ids
    }

    /// Streams whose connect deadline has passed.
    pub fn expired_connects(&self, now: Instant) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, e)| {
                e.state == StreamState::Opening
                    && e.connect_deadline.map(|d| now >= d).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
