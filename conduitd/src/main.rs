use clap::{App, Arg};
use conduit::net::address;
use conduit::net::endpoint::Communicator;
use conduit::net::queue::{Direction, QueueId};
use conduit::net::upstream::{Delivery, Upstream};
use flint::identity::PeerIdentity;
use flint::logging;
use std::net::SocketAddr;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

mod config;

use config::Config;

const SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// Stand-in transport service for running the communicator on its own:
/// logs every event and acknowledges deliveries on the next loop pass.
struct ServiceUpstream {
    log: logging::Logger,
    pending_acks: Vec<QueueId>,
}

impl ServiceUpstream {
    fn new(log: &logging::Logger) -> ServiceUpstream {
        ServiceUpstream {
            log: log.new(logging::o!("component" => "upstream")),
            pending_acks: Vec::new(),
        }
    }

    fn take_acks(&mut self) -> Vec<QueueId> {
        std::mem::take(&mut self.pending_acks)
    }
}

impl Upstream for ServiceUpstream {
    fn announce_address(&mut self, address: &str) {
        logging::info!(self.log, "address available"; "address" => address);
    }

    fn queue_added(&mut self, peer: &PeerIdentity, queue: QueueId, address: &str, direction: Direction) {
        logging::info!(self.log, "queue added";
                       "peer" => %peer,
                       "queue_id" => queue,
                       "address" => address,
                       "direction" => ?direction);
    }

    fn queue_removed(&mut self, queue: QueueId) {
        logging::info!(self.log, "queue removed"; "queue_id" => queue);
    }

    fn deliver_receive(&mut self, peer: &PeerIdentity, queue: QueueId, payload: &[u8]) -> Delivery {
        logging::info!(self.log, "payload received";
                       "peer" => %peer,
                       "queue_id" => queue,
                       "size" => payload.len());
        self.pending_acks.push(queue);
        Delivery::Ok
    }

    fn send_continue(&mut self, queue: QueueId) {
        logging::debug!(self.log, "send window open"; "queue_id" => queue);
    }
}

pub fn main() {
    let matches = App::new("Conduit Communicator")
        .version("1.0")
        .author("Conduit Networks")
        .about("Runs the TCP transport communicator.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();

    let config = match Config::load(config_file_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config file: {}", err);
            process::exit(1);
        }
    };

    let log = match logging::init(&config.logging) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("Error building logger: {}", err);
            process::exit(1);
        }
    };

    let mut bind_addrs: Vec<SocketAddr> = Vec::new();
    for spec in &config.communicator.bindto {
        match address::expand_bind_spec(spec, config.communicator.disable_v6) {
            Ok(addrs) => bind_addrs.extend(addrs),
            Err(err) => {
                logging::crit!(log, "invalid bind specification"; "spec" => spec.as_str(), "error" => ?err);
                process::exit(1);
            }
        }
    }

    if bind_addrs.is_empty() {
        logging::crit!(log, "no bind address configured");
        process::exit(1);
    }

    let identity = config.communicator.private_key.clone();
    logging::info!(log, "communicator starting"; "identity" => %identity.peer_identity());

    let upstream = ServiceUpstream::new(&log);

    let mut communicator =
        match Communicator::new(&bind_addrs, identity, config.comm_config(), upstream, &log) {
            Ok(communicator) => communicator,
            Err(err) => {
                logging::crit!(log, "startup failed"; "error" => ?err);
                process::exit(1);
            }
        };

    loop {
        communicator.sync(Instant::now());

        let acks = communicator.upstream_mut().take_acks();
        for queue in acks {
            communicator.acknowledge(queue);
        }

        thread::sleep(SYNC_INTERVAL);
    }
}
