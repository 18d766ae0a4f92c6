//! In-memory transport.
//!
//! Notifications are queued by the test (or produced by a [`Responder`] in
//! reaction to each write) and every write is captured with its endpoint.
//! Link faults are injected one at a time with [`MockTransport::inject`].

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use sync_types::EndpointId;

/// Device behaviour: maps one write to the notifications it triggers.
pub type Responder = Arc<dyn Fn(EndpointId, &[u8]) -> Vec<(EndpointId, Vec<u8>)> + Send + Sync>;

/// A one-shot link fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next `connect()` fails.
    Connect(String),
    /// The next `send()` is rejected.
    Write(String),
    /// The next `recv()` fails; queued notifications stay queued.
    Notify(String),
    /// The device drops the link before the next `recv()`.
    Disconnect,
}

/// Shared in-memory link to a pretend device.
///
/// Clones share state, so a test can keep one handle while the session
/// owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    link: Arc<Mutex<Link>>,
}

#[derive(Default)]
struct Link {
    address: Option<String>,
    connected: bool,
    mtu: Option<usize>,
    writes: Vec<(EndpointId, Vec<u8>)>,
    notifications: VecDeque<(EndpointId, Vec<u8>)>,
    responder: Option<Responder>,
    hang_when_empty: bool,
    faults: VecDeque<Fault>,
}

impl Link {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        self.faults.remove(index)
    }
}

impl MockTransport {
    /// An unconnected mock with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose device answers every write through `responder`.
    pub fn with_responder(responder: Responder) -> Self {
        let transport = Self::new();
        transport.set_responder(responder);
        transport
    }

    /// Reject writes longer than `mtu` bytes.
    pub fn with_mtu(self, mtu: usize) -> Self {
        self.link.lock().unwrap().mtu = Some(mtu);
        self
    }

    /// Queue a notification for `recv()`.
    pub fn queue_response(&self, endpoint: EndpointId, data: Vec<u8>) {
        self.link
            .lock()
            .unwrap()
            .notifications
            .push_back((endpoint, data));
    }

    /// Replace the device behaviour.
    pub fn set_responder(&self, responder: Responder) {
        self.link.lock().unwrap().responder = Some(responder);
    }

    /// Make `recv()` wait forever instead of reporting a disconnect when
    /// nothing is queued. Used to exercise response timeouts.
    pub fn hang_when_empty(&self, hang: bool) {
        self.link.lock().unwrap().hang_when_empty = hang;
    }

    /// Arm a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.link.lock().unwrap().faults.push_back(fault);
    }

    /// Shorthand for `inject(Fault::Write(..))`.
    pub fn fail_next_send(&self, reason: &str) {
        self.inject(Fault::Write(reason.to_string()));
    }

    /// Every accepted write, in order.
    pub fn sent_messages(&self) -> Vec<(EndpointId, Vec<u8>)> {
        self.link.lock().unwrap().writes.clone()
    }

    /// Accepted writes to one endpoint.
    pub fn writes_to(&self, endpoint: EndpointId) -> Vec<Vec<u8>> {
        let link = self.link.lock().unwrap();
        link.writes
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Notifications not yet received.
    pub fn pending_responses(&self) -> usize {
        self.link.lock().unwrap().notifications.len()
    }

    /// Address of the last successful connect.
    pub fn address(&self) -> Option<String> {
        self.link.lock().unwrap().address.clone()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link.lock().unwrap();
        f.debug_struct("MockTransport")
            .field("address", &link.address)
            .field("connected", &link.connected)
            .field("writes", &link.writes.len())
            .field("queued", &link.notifications.len())
            .field("faults", &link.faults)
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if let Some(Fault::Connect(reason)) = link.take_fault(|f| matches!(f, Fault::Connect(_))) {
            return Err(TransportError::ConnectFailed {
                address: address.to_string(),
                reason,
            });
        }
        link.connected = true;
        link.address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, endpoint: EndpointId, data: &[u8]) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        if !link.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(mtu) = link.mtu.filter(|&mtu| data.len() > mtu) {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                mtu,
            });
        }
        if let Some(Fault::Write(reason)) = link.take_fault(|f| matches!(f, Fault::Write(_))) {
            return Err(TransportError::WriteFailed { endpoint, reason });
        }

        link.writes.push((endpoint, data.to_vec()));
        if let Some(responder) = link.responder.clone() {
            // The responder may lock its own state, never this link.
            let replies = responder(endpoint, data);
            link.notifications.extend(replies);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<(EndpointId, Vec<u8>), TransportError> {
        let next = {
            let mut link = self.link.lock().unwrap();
            if !link.connected {
                return Err(TransportError::NotConnected);
            }
            match link.take_fault(|f| matches!(f, Fault::Notify(_) | Fault::Disconnect)) {
                Some(Fault::Notify(reason)) => return Err(TransportError::NotifyFailed(reason)),
                Some(_) => {
                    link.connected = false;
                    return Err(TransportError::Disconnected);
                }
                None => {}
            }
            match link.notifications.pop_front() {
                Some(notification) => Some(notification),
                None if link.hang_when_empty => None,
                None => return Err(TransportError::Disconnected),
            }
        };

        match next {
            Some(notification) => Ok(notification),
            None => std::future::pending().await,
        }
    }

    fn is_connected(&self) -> bool {
        self.link.lock().unwrap().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.lock().unwrap().connected = false;
        Ok(())
    }
}
