use crate::net::address;
use crate::net::queue::{ProtoQueue, Queue, QueueId, QueueState, QueueTuning, TickCtx};
use crate::net::session;
use flint::identity::{IdentityKey, PeerIdentity};
use flint::logging;
use flint::shared::{ErrorType, NetworkError, NetworkResult};
use crate::net::upstream::Upstream;
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// Accept errno values that signal descriptor exhaustion.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// Communicator-wide configuration knobs.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Per-queue in-flight upstream messages before reads are suspended.
    pub max_queue_length: u32,
    /// Outbound rekey time ceiling.
    pub rekey_interval: Duration,
    /// Upper bound of the randomized outbound rekey byte budget.
    pub rekey_max_bytes: u64,
    /// Quiet time after which a live session is finished.
    pub idle_timeout: Duration,
    /// Absolute deadline for an inbound connection to present its handshake.
    pub proto_timeout: Duration,
}

impl Default for CommConfig {
    fn default() -> CommConfig {
        CommConfig {
            max_queue_length: 8,
            rekey_interval: Duration::from_secs(24 * 60 * 60),
            rekey_max_bytes: 4 * 1024 * 1024 * 1024,
            idle_timeout: Duration::from_secs(5 * 60),
            proto_timeout: Duration::from_secs(60),
        }
    }
}

impl CommConfig {
    fn tuning(&self) -> QueueTuning {
        QueueTuning {
            max_queue_length: self.max_queue_length,
            rekey_interval: self.rekey_interval,
            rekey_max_bytes: self.rekey_max_bytes,
        }
    }
}

/// The communicator context: listening sockets, the pre-session and live
/// queue tables, the peer map, and the single upstream transport service.
/// Driven by calling `sync` from one thread; no callback ever runs
/// concurrently with another.
pub struct Communicator<U: Upstream> {
    listeners: Vec<TcpListener>,

    accept_poll: mio::Poll,
    proto_poll: mio::Poll,
    live_poll: mio::Poll,
    events: mio::Events,

    identity: IdentityKey,
    config: CommConfig,

    queues: Vec<Option<Queue>>,
    free: Vec<QueueId>,
    live: IndexSet<QueueId>,

    protoqueues: Vec<Option<ProtoQueue>>,
    proto_free: Vec<usize>,

    queue_map: HashMap<PeerIdentity, Vec<QueueId>>,
    monotimes: HashMap<PeerIdentity, u64>,

    upstream: U,

    accept_paused: bool,
    accept_resume: bool,

    current_time: Instant,
    housekeeping_time: Instant,

    log: logging::Logger,
}

impl<U: Upstream> Communicator<U> {
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
    const ZERO_TIME: Duration = Duration::from_millis(0);

    /// Binds the listening sockets and announces their addresses upstream.
    /// A failed IPv6 wildcard bind is tolerated while any other listener is
    /// up; anything else is a startup error.
    pub fn new(
        bind_addrs: &[SocketAddr],
        identity: IdentityKey,
        config: CommConfig,
        mut upstream: U,
        log: &logging::Logger,
    ) -> NetworkResult<Communicator<U>> {
        let accept_poll = mio::Poll::new()?;
        let mut listeners = Vec::new();

        for addr in bind_addrs {
            let listener = match TcpListener::bind(addr) {
                Ok(listener) => listener,
                Err(err) if addr.is_ipv6() && !bind_addrs.iter().all(SocketAddr::is_ipv6) => {
                    logging::warn!(log, "skipping IPv6 listener"; "addr" => %addr, "error" => %err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            accept_poll.register(
                &listener,
                mio::Token(listeners.len()),
                mio::Ready::readable(),
                mio::PollOpt::edge(),
            )?;

            listeners.push(listener);
        }

        if listeners.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::AddrParse));
        }

        for listener in &listeners {
            let addr = listener.local_addr()?;
            logging::info!(log, "listening"; "addr" => %addr);
            upstream.announce_address(&address::format_address(&addr));
        }

        let now = Instant::now();

        Ok(Communicator {
            listeners,
            accept_poll,
            proto_poll: mio::Poll::new()?,
            live_poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(8192),
            identity,
            config,
            queues: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            protoqueues: Vec::new(),
            proto_free: Vec::new(),
            queue_map: HashMap::new(),
            monotimes: HashMap::new(),
            upstream,
            accept_paused: false,
            accept_resume: false,
            current_time: now,
            housekeeping_time: now,
            log: log.new(logging::o!()),
        })
    }

    /// The identity other peers know this communicator by.
    #[inline]
    pub fn identity(&self) -> PeerIdentity {
        self.identity.peer_identity()
    }

    /// Bound listener addresses, with concrete ports after an `:0` bind.
    pub fn local_addresses(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    #[inline]
    pub fn upstream_mut(&mut self) -> &mut U {
        &mut self.upstream
    }

    #[inline]
    pub fn queue_state(&self, id: QueueId) -> Option<QueueState> {
        self.queues.get(id).and_then(Option::as_ref).map(Queue::state)
    }

    #[inline]
    pub fn queue_established(&self, id: QueueId) -> bool {
        self.queues
            .get(id)
            .and_then(Option::as_ref)
            .map_or(false, Queue::established)
    }

    /// Queues currently mapped for `peer` (a peer may have several).
    pub fn peer_queues(&self, peer: &PeerIdentity) -> Vec<QueueId> {
        self.queue_map.get(peer).cloned().unwrap_or_default()
    }

    /// One pass of the event loop: housekeeping, a write pass over live
    /// queues, then the accept, pre-session and live polls.
    pub fn sync(&mut self, now: Instant) {
        self.current_time = now;

        if now.duration_since(self.housekeeping_time) >= Self::HOUSEKEEPING_INTERVAL {
            self.housekeeping();
            self.housekeeping_time = now;
        }

        let flush: Vec<QueueId> = self.live.iter().copied().collect();
        for id in flush {
            self.drive_write(id);
        }

        self.poll_accept();
        self.poll_proto();
        self.poll_live();
    }

    /// The upstream asks for a session to `peer` at `tcp-HOST:PORT`. The
    /// connect is non-blocking; the handshake is staged and flushed once the
    /// socket reports writable.
    pub fn connect_to(&mut self, peer: PeerIdentity, address_text: &str) -> NetworkResult<QueueId> {
        let addr = address::parse_peer_address(address_text)?;
        let stream = TcpStream::connect(&addr)?;

        let id = self.alloc_queue_slot();
        let queue = match Queue::dialed(
            id,
            &self.identity,
            peer,
            addr,
            Some(stream),
            self.config.tuning(),
            self.current_time,
            &self.log,
        ) {
            Ok(queue) => queue,
            Err(err) => {
                self.free.push(id);
                return Err(err);
            }
        };

        self.live_poll.register(
            queue.stream().expect("Dialed queue must have valid stream"),
            mio::Token(id),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        logging::debug!(self.log, "dialing"; "peer" => %peer, "addr" => %addr, "queue_id" => id);
        self.install_queue(id, queue);

        Ok(id)
    }

    /// Submits one upstream message for transmission on `id`.
    pub fn mq_send(&mut self, id: QueueId, msg: &[u8]) -> NetworkResult<()> {
        {
            let queue = self
                .queues
                .get_mut(id)
                .and_then(Option::as_mut)
                .ok_or(NetworkError::Fatal(ErrorType::QueueFinishing))?;
            queue.submit(msg)?;
        }

        self.drive_write(id);
        Ok(())
    }

    /// Drops the current unsent plaintext on `id`.
    pub fn mq_cancel(&mut self, id: QueueId) {
        if let Some(queue) = self.queues.get_mut(id).and_then(Option::as_mut) {
            queue.cancel();
        }
    }

    /// The upstream is done with this session; finish gracefully.
    pub fn mq_destroy(&mut self, id: QueueId) {
        self.finish_queue(id);
    }

    /// The upstream reports a session-level error; finish gracefully.
    pub fn mq_error(&mut self, id: QueueId, error: &str) {
        logging::error!(self.log, "upstream error"; "queue_id" => id, "error" => error);
        self.finish_queue(id);
    }

    /// Completion of one upstream delivery: drains backpressure, frees a
    /// deferred queue slot, and resumes a suspended reader.
    pub fn acknowledge(&mut self, id: QueueId) {
        let (resumed, state, backpressure) = {
            let queue = match self.queues.get_mut(id).and_then(Option::as_mut) {
                Some(queue) => queue,
                None => return,
            };

            let resumed = queue.acknowledge();
            (resumed, queue.state(), queue.backpressure())
        };

        if state == QueueState::Destroyed {
            if backpressure == 0 {
                self.queues[id] = None;
                self.free.push(id);
            }
            return;
        }

        if resumed {
            self.queue_readable(id);
        }
    }

    fn alloc_queue_slot(&mut self) -> QueueId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.queues.push(None);
                self.queues.len() - 1
            }
        }
    }

    fn install_queue(&mut self, id: QueueId, queue: Queue) {
        let peer = *queue.peer();
        let addr_text = address::format_address(queue.addr());
        let direction = queue.direction();

        self.queues[id] = Some(queue);
        self.live.insert(id);
        self.queue_map.entry(peer).or_default().push(id);
        self.upstream.queue_added(&peer, id, &addr_text, direction);
    }

    /// Outbound tick plus the state transitions it can trigger.
    fn drive_write(&mut self, id: QueueId) {
        let result = {
            let queue = match self.queues.get_mut(id).and_then(Option::as_mut) {
                Some(queue) => queue,
                None => return,
            };

            let mut ctx = TickCtx {
                upstream: &mut self.upstream,
                identity: &self.identity,
                monotimes: &mut self.monotimes,
                now: self.current_time,
            };

            queue.write_tick(&mut ctx)
        };

        match result {
            Ok(()) => {
                if self.queue_state(id) == Some(QueueState::Destroyed) {
                    self.destroy_queue(id);
                }
            }
            Err(NetworkError::Wait) => {}
            Err(NetworkError::Fatal(err)) => self.handle_fatal(id, err),
        }
    }

    /// Inbound socket tick: read, then decrypt-and-dispatch, repeating while
    /// the kernel keeps producing data and the queue stays live. A full
    /// ciphertext buffer earns another read once draining made room, since
    /// the edge-triggered readiness event is already spent.
    fn queue_readable(&mut self, id: QueueId) {
        loop {
            let (received, was_full) = {
                let queue = match self.queues.get_mut(id).and_then(Option::as_mut) {
                    Some(queue) => queue,
                    None => return,
                };

                let was_full = queue.is_read_buffer_full();

                match queue.receive(self.current_time) {
                    Ok(received) => (received, was_full),
                    Err(NetworkError::Wait) => (0, was_full),
                    Err(NetworkError::Fatal(err)) => {
                        self.handle_fatal(id, err);
                        return;
                    }
                }
            };

            self.drain_queue(id);

            match self.queues.get(id).and_then(Option::as_ref) {
                None => return,
                Some(queue) if queue.state() != QueueState::Live => return,
                Some(queue) if queue.is_reader_suspended() => return,
                Some(_) => {}
            }

            if received == 0 && !was_full {
                break;
            }
        }
    }

    fn drain_queue(&mut self, id: QueueId) {
        let (result, state, peer_closed) = {
            let queue = match self.queues.get_mut(id).and_then(Option::as_mut) {
                Some(queue) => queue,
                None => return,
            };

            let mut ctx = TickCtx {
                upstream: &mut self.upstream,
                identity: &self.identity,
                monotimes: &mut self.monotimes,
                now: self.current_time,
            };

            let result = queue.pump(&mut ctx);
            (result, queue.state(), queue.peer_closed())
        };

        match result {
            Ok(()) => {
                if state == QueueState::Destroyed || peer_closed {
                    self.destroy_queue(id);
                } else {
                    self.drive_write(id);
                }
            }
            Err(NetworkError::Wait) => {}
            Err(NetworkError::Fatal(err)) => self.handle_fatal(id, err),
        }
    }

    /// Queue-local error policy: forged signatures and replays kill the
    /// queue outright; everything else gets a graceful finish while the
    /// socket still works.
    fn handle_fatal(&mut self, id: QueueId, err: ErrorType) {
        logging::debug!(self.log, "queue failure"; "queue_id" => id, "error" => ?err);

        let state = match self.queue_state(id) {
            Some(state) => state,
            None => return,
        };

        match err {
            ErrorType::SignatureInvalid | ErrorType::ReplayDetected => self.destroy_queue(id),
            _ if state == QueueState::Live => self.finish_queue(id),
            _ => self.destroy_queue(id),
        }
    }

    fn finish_queue(&mut self, id: QueueId) {
        {
            let queue = match self.queues.get_mut(id).and_then(Option::as_mut) {
                Some(queue) => queue,
                None => return,
            };
            queue.start_finish();
        }

        self.drive_write(id);
    }

    /// Removes the queue from every table and closes its socket. The slot
    /// itself is freed once upstream acknowledgements drain.
    fn destroy_queue(&mut self, id: QueueId) {
        if !self.live.swap_remove(&id) {
            return;
        }

        let (peer, backpressure) = {
            let queue = self.queues[id]
                .as_mut()
                .expect("Live set entries must have a queue");

            if let Some(stream) = queue.stream() {
                let _ = self.live_poll.deregister(stream);
            }
            queue.close();
            queue.mark_destroyed();

            (*queue.peer(), queue.backpressure())
        };

        if let Some(ids) = self.queue_map.get_mut(&peer) {
            ids.retain(|&mapped| mapped != id);
            if ids.is_empty() {
                self.queue_map.remove(&peer);
            }
        }

        self.upstream.queue_removed(id);

        if backpressure == 0 {
            self.queues[id] = None;
            self.free.push(id);
        }

        // A descriptor was released; accepting may continue.
        if self.accept_paused {
            self.accept_paused = false;
            self.accept_resume = true;
        }
    }

    fn poll_accept(&mut self) {
        self.accept_poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Accept poll failed");

        let mut pending: Vec<usize> = self.events.iter().map(|event| event.token().0).collect();

        if self.accept_resume {
            self.accept_resume = false;
            pending = (0..self.listeners.len()).collect();
        }

        if self.accept_paused {
            return;
        }

        for index in pending {
            self.accept_from(index);
        }
    }

    fn accept_from(&mut self, index: usize) {
        loop {
            match self.listeners[index].accept() {
                Ok((stream, addr)) => self.new_protoqueue(stream, addr),
                Err(err) => {
                    match err.raw_os_error() {
                        Some(EMFILE) | Some(ENFILE) => {
                            logging::warn!(self.log, "descriptor exhaustion, accept paused"; "error" => %err);
                            self.accept_paused = true;
                        }
                        _ if err.kind() == io::ErrorKind::WouldBlock => {}
                        _ => {
                            logging::error!(self.log, "accept failed"; "error" => %err);
                        }
                    }
                    break;
                }
            }
        }
    }

    fn new_protoqueue(&mut self, stream: TcpStream, addr: SocketAddr) {
        let index = match self.proto_free.pop() {
            Some(index) => index,
            None => {
                self.protoqueues.push(None);
                self.protoqueues.len() - 1
            }
        };

        let proto = ProtoQueue::new(stream, addr, self.current_time, self.config.proto_timeout);

        self.proto_poll
            .register(
                proto.stream().expect("Fresh protoqueue must have valid stream"),
                mio::Token(index),
                mio::Ready::readable(),
                mio::PollOpt::edge(),
            )
            .expect("Stream registration failed");

        logging::debug!(self.log, "connection accepted"; "addr" => %addr);
        self.protoqueues[index] = Some(proto);
    }

    fn poll_proto(&mut self) {
        self.proto_poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Pre-session poll failed");

        let pending: Vec<usize> = self
            .events
            .iter()
            .filter(|event| event.readiness().is_readable())
            .map(|event| event.token().0)
            .collect();

        for index in pending {
            self.proto_readable(index);
        }
    }

    fn proto_readable(&mut self, index: usize) {
        let complete = {
            let proto = match self.protoqueues.get_mut(index).and_then(Option::as_mut) {
                Some(proto) => proto,
                None => return,
            };

            match proto.read() {
                Ok(complete) => complete,
                Err(NetworkError::Wait) => false,
                Err(_) => {
                    self.drop_protoqueue(index, "handshake read failed");
                    return;
                }
            }
        };

        if complete {
            self.promote(index);
        }
    }

    /// An inbound connection delivered its 136 handshake bytes: verify them
    /// and either promote to a live queue or drop the connection.
    fn promote(&mut self, index: usize) {
        let mut proto = self.protoqueues[index]
            .take()
            .expect("Promotion requires a protoqueue");
        self.proto_free.push(index);

        if let Some(stream) = proto.stream() {
            let _ = self.proto_poll.deregister(stream);
        }

        let outcome = match session::accept_handshake(&self.identity, proto.handshake()) {
            Ok(outcome) => outcome,
            Err(err) => {
                logging::debug!(self.log, "handshake rejected"; "addr" => %proto.addr(), "error" => ?err);
                proto.close();
                return;
            }
        };

        if let Some(previous) = self.monotimes.get(&outcome.sender) {
            if outcome.monotonic_time <= *previous {
                logging::debug!(self.log, "handshake replayed"; "peer" => %outcome.sender);
                proto.close();
                return;
            }
        }
        self.monotimes.insert(outcome.sender, outcome.monotonic_time);

        let id = self.alloc_queue_slot();
        let addr = *proto.addr();
        let stream = proto.take_stream();

        let queue = match Queue::accepted(
            id,
            &self.identity,
            outcome.sender,
            addr,
            Some(stream),
            outcome.inbound,
            outcome.monotonic_time,
            self.config.tuning(),
            self.current_time,
            &self.log,
        ) {
            Ok(queue) => queue,
            Err(err) => {
                logging::debug!(self.log, "promotion failed"; "error" => ?err);
                self.free.push(id);
                return;
            }
        };

        self.live_poll
            .register(
                queue.stream().expect("Promoted queue must have valid stream"),
                mio::Token(id),
                mio::Ready::readable() | mio::Ready::writable(),
                mio::PollOpt::edge(),
            )
            .expect("Stream registration failed");

        logging::debug!(self.log, "protoqueue promoted"; "peer" => %outcome.sender, "queue_id" => id);
        self.install_queue(id, queue);
    }

    fn drop_protoqueue(&mut self, index: usize, reason: &str) {
        let mut proto = match self.protoqueues[index].take() {
            Some(proto) => proto,
            None => return,
        };
        self.proto_free.push(index);

        if let Some(stream) = proto.stream() {
            let _ = self.proto_poll.deregister(stream);
        }

        logging::debug!(self.log, "protoqueue dropped"; "addr" => %proto.addr(), "reason" => reason);
        proto.close();

        if self.accept_paused {
            self.accept_paused = false;
            self.accept_resume = true;
        }
    }

    fn poll_live(&mut self) {
        self.live_poll
            .poll(&mut self.events, Some(Self::ZERO_TIME))
            .expect("Live poll failed");

        let pending: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token().0,
                    event.readiness().is_readable(),
                    event.readiness().is_writable(),
                )
            })
            .collect();

        for (id, readable, writable) in pending {
            if writable {
                if let Some(queue) = self.queues.get_mut(id).and_then(Option::as_mut) {
                    queue.mark_connected();
                }
                self.drive_write(id);
            }

            if readable {
                self.queue_readable(id);
            }
        }
    }

    /// Timer pass: pre-session deadlines and idle sessions. Rekey deadlines
    /// are checked by every outbound tick.
    fn housekeeping(&mut self) {
        let now = self.current_time;

        let expired: Vec<usize> = self
            .protoqueues
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|proto| (index, proto.deadline())))
            .filter(|(_, deadline)| now >= *deadline)
            .map(|(index, _)| index)
            .collect();

        for index in expired {
            self.drop_protoqueue(index, "handshake deadline");
        }

        let idle: Vec<QueueId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| {
                self.queues[id].as_ref().map_or(false, |queue| {
                    queue.state() == QueueState::Live
                        && queue.idle_elapsed(now) >= self.config.idle_timeout
                })
            })
            .collect();

        for id in idle {
            logging::debug!(self.log, "idle timeout"; "queue_id" => id);
            self.finish_queue(id);
        }
    }
}
