use tracing::{debug, trace};
use crate::session::error::SessionError;
use crate::session::event::{Event, RequestToken};
use crate::transport::PeerHandle;

/// What a listener callback gets to see of an event. `data` borrows the packet payload, which
///  is released when the callback returns: copy it to keep it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PeerData<'a> {
    pub peer: PeerHandle,
    pub channel: u8,
    /// payload for receive events, connect data for a server's connect events, empty otherwise
    pub data: &'a [u8],
    pub request: Option<RequestToken>,
}

/// Application callbacks, invoked synchronously from inside `poll()`. Callbacks must return
///  quickly: they run inside the poll's time budget.
pub trait Listener: Send {
    fn on_connect(&mut self, data: PeerData);
    fn on_disconnect(&mut self, data: PeerData);
    fn on_receive(&mut self, data: PeerData);

    /// A locally requested connect was refused, timed out or cancelled
    fn on_connect_failed(&mut self, data: PeerData) {
        trace!("connect request {:?} for {:?} failed - no callback", data.request, data.peer);
    }
}

type Callback = Box<dyn FnMut(PeerData) + Send>;

/// A [Listener] assembled from closures
pub struct CallbackListener {
    on_connect: Callback,
    on_disconnect: Callback,
    on_receive: Callback,
}

impl CallbackListener {
    pub fn new(
        on_connect: impl FnMut(PeerData) + Send + 'static,
        on_disconnect: impl FnMut(PeerData) + Send + 'static,
        on_receive: impl FnMut(PeerData) + Send + 'static,
    ) -> CallbackListener {
        CallbackListener {
            on_connect: Box::new(on_connect),
            on_disconnect: Box::new(on_disconnect),
            on_receive: Box::new(on_receive),
        }
    }
}

impl Listener for CallbackListener {
    fn on_connect(&mut self, data: PeerData) {
        (self.on_connect)(data)
    }

    fn on_disconnect(&mut self, data: PeerData) {
        (self.on_disconnect)(data)
    }

    fn on_receive(&mut self, data: PeerData) {
        (self.on_receive)(data)
    }
}

/// Holds the single installed listener. The registry owns it, so it lives exactly as long as
///  it can be called.
#[derive(Default)]
pub struct ListenerRegistry {
    listener: Option<Box<dyn Listener>>,
}

impl ListenerRegistry {
    /// Installs `listener`, returning the one it replaces
    pub fn install(&mut self, listener: Box<dyn Listener>) -> Option<Box<dyn Listener>> {
        let previous = self.listener.replace(listener);
        if previous.is_some() {
            debug!("replacing installed listener");
        }
        previous
    }

    pub fn uninstall(&mut self) -> Option<Box<dyn Listener>> {
        self.listener.take()
    }

    pub fn is_installed(&self) -> bool {
        self.listener.is_some()
    }

    pub fn lookup(&mut self) -> Result<&mut dyn Listener, SessionError> {
        match &mut self.listener {
            Some(l) => Ok(l.as_mut()),
            None => Err(SessionError::NoListenerInstalled),
        }
    }

    /// Invokes the callback matching the event's kind
    pub fn dispatch(&mut self, event: &Event) -> Result<(), SessionError> {
        let listener = self.lookup()?;
        trace!("dispatching {:?}", event);

        match event {
            Event::Connect { peer, data, request } => {
                listener.on_connect(PeerData { peer: *peer, channel: 0, data, request: *request })
            }
            Event::Disconnect { peer, request } => {
                listener.on_disconnect(PeerData { peer: *peer, channel: 0, data: &[], request: *request })
            }
            Event::Receive { peer, channel, data } => {
                listener.on_receive(PeerData { peer: *peer, channel: *channel, data, request: None })
            }
            Event::ConnectFailed { peer, request } => {
                listener.on_connect_failed(PeerData { peer: *peer, channel: 0, data: &[], request: *request })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use bytes::Bytes;
    use crate::session::error::SessionError;
    use crate::session::event::{Event, RequestToken};
    use crate::transport::{HostHandle, PeerHandle};
    use super::*;

    fn peer(slot: u16) -> PeerHandle {
        PeerHandle { host: HostHandle::from_raw(1), slot, generation: 0 }
    }

    /// records "<kind>:<slot>:<data>" for every callback
    fn recording_listener(log: Arc<Mutex<Vec<String>>>) -> CallbackListener {
        let l1 = log.clone();
        let l2 = log.clone();
        let l3 = log;
        CallbackListener::new(
            move |d| l1.lock().unwrap().push(format!("connect:{}:{}", d.peer.slot, String::from_utf8_lossy(d.data))),
            move |d| l2.lock().unwrap().push(format!("disconnect:{}", d.peer.slot)),
            move |d| l3.lock().unwrap().push(format!("receive:{}:{}:{}", d.peer.slot, d.channel, String::from_utf8_lossy(d.data))),
        )
    }

    #[test]
    fn test_dispatch_without_listener() {
        let mut registry = ListenerRegistry::default();
        assert!(!registry.is_installed());
        assert!(matches!(registry.lookup(), Err(SessionError::NoListenerInstalled)));

        let event = Event::Disconnect { peer: peer(0), request: None };
        assert!(matches!(registry.dispatch(&event), Err(SessionError::NoListenerInstalled)));
    }

    #[test]
    fn test_dispatch_by_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        assert!(registry.install(Box::new(recording_listener(log.clone()))).is_none());

        registry.dispatch(&Event::Connect { peer: peer(1), data: Bytes::from_static(b"alice"), request: None }).unwrap();
        registry.dispatch(&Event::Receive { peer: peer(1), channel: 2, data: Bytes::from_static(b"ping") }).unwrap();
        registry.dispatch(&Event::ConnectFailed { peer: peer(3), request: Some(RequestToken::from_raw(1)) }).unwrap();
        registry.dispatch(&Event::Disconnect { peer: peer(1), request: None }).unwrap();

        assert_eq!(*log.lock().unwrap(), vec![
            "connect:1:alice".to_string(),
            "receive:1:2:ping".to_string(),
            "disconnect:1".to_string(),
        ]);
    }

    #[test]
    fn test_replaced_listener_is_not_called() {
        let old_log = Arc::new(Mutex::new(Vec::new()));
        let new_log = Arc::new(Mutex::new(Vec::new()));

        let mut registry = ListenerRegistry::default();
        registry.install(Box::new(recording_listener(old_log.clone())));
        let replaced = registry.install(Box::new(recording_listener(new_log.clone())));
        assert!(replaced.is_some());

        registry.dispatch(&Event::Disconnect { peer: peer(0), request: None }).unwrap();
        assert!(old_log.lock().unwrap().is_empty());
        assert_eq!(new_log.lock().unwrap().len(), 1);

        assert!(registry.uninstall().is_some());
        assert!(!registry.is_installed());
    }
}
