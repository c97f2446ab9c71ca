use std::sync::{Arc, Mutex};
use bytes::Bytes;
use crate::session::{Event, Listener, PeerData};

/// A [Listener] that records every callback as an [Event]. Clones share the recording, so a
///  test can install one clone and inspect the other.
#[derive(Clone, Debug, Default)]
pub struct RecordingListener {
    tracker: Arc<Mutex<Vec<Event>>>,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        RecordingListener::default()
    }

    fn record(&self, event: Event) {
        match self.tracker.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        match self.tracker.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// removes and returns everything recorded so far
    pub fn take_events(&self) -> Vec<Event> {
        match self.tracker.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn num_connects(&self) -> usize {
        self.events().iter()
            .filter(|e| matches!(e, Event::Connect { .. }))
            .count()
    }

    pub fn num_disconnects(&self) -> usize {
        self.events().iter()
            .filter(|e| matches!(e, Event::Disconnect { .. }))
            .count()
    }

    /// payloads of all receive events, in order
    pub fn received(&self) -> Vec<Bytes> {
        self.events().into_iter()
            .filter_map(|e| match e {
                Event::Receive { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }
}

impl Listener for RecordingListener {
    fn on_connect(&mut self, data: PeerData) {
        self.record(Event::Connect { peer: data.peer, data: Bytes::copy_from_slice(data.data), request: data.request });
    }

    fn on_disconnect(&mut self, data: PeerData) {
        self.record(Event::Disconnect { peer: data.peer, request: data.request });
    }

    fn on_receive(&mut self, data: PeerData) {
        self.record(Event::Receive { peer: data.peer, channel: data.channel, data: Bytes::copy_from_slice(data.data) });
    }

    fn on_connect_failed(&mut self, data: PeerData) {
        self.record(Event::ConnectFailed { peer: data.peer, request: data.request });
    }
}
