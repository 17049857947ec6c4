use crate::net::queue::{Direction, QueueId};
use flint::identity::PeerIdentity;

/// Outcome of handing an inbound payload to the transport service.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Delivery {
    /// Accepted; an acknowledgement will follow once the service has
    /// processed the message.
    Ok,
    /// Refused; the service is over its backpressure budget. The payload
    /// stays queued and is offered again after acknowledgements drain.
    Dropped,
}

/// The transport service sitting above the communicator. Exactly one
/// upstream drives a communicator; it receives inbound payloads tagged by
/// peer and is notified of queue lifecycle changes.
///
/// Every `Delivery::Ok` must eventually be answered through
/// `Communicator::acknowledge` for the same queue; acknowledgements drain
/// the backpressure counter and resume suspended readers.
pub trait Upstream {
    /// A listen address of this communicator, in `tcp-HOST:PORT` form.
    fn announce_address(&mut self, address: &str);

    /// A new session to `peer` is available for transmission.
    fn queue_added(&mut self, peer: &PeerIdentity, queue: QueueId, address: &str, direction: Direction);

    /// The session is gone; no further submits or deliveries for it.
    fn queue_removed(&mut self, queue: QueueId);

    /// An authenticated payload arrived from `peer`.
    fn deliver_receive(&mut self, peer: &PeerIdentity, queue: QueueId, payload: &[u8]) -> Delivery;

    /// The previous submit has left the plaintext buffer; the next message
    /// may be submitted on this queue.
    fn send_continue(&mut self, queue: QueueId);
}
