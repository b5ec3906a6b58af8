use crate::{
    bencode::Value,
    compact,
    id::{InfoHash, NodeId},
    socket::Socket,
    table::RoutingTable,
    worker::{Command, DhtEvent, DhtHandler, Mutability, OpEvent},
};
use ed25519_dalek::SigningKey;
use futures_util::Stream;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{sync::mpsc, task};

/// Handle to a running DHT node.
///
/// This type is cheaply cloneable where each clone refers to the same
/// underlying DHT instance. The node itself runs on a spawned task; it stops
/// when [`Dht::stop`] is called or every handle is dropped.
#[derive(Clone)]
pub struct Dht {
    tx: mpsc::UnboundedSender<Command>,
}

impl Dht {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            port: 6881,
            node_id: None,
            seed: None,
            bootstrap: Vec::new(),
            external_ip: None,
        }
    }

    /// Find peers for the info hash and announce ourselves to the closest
    /// nodes, so that others looking the info hash up will find our contact
    /// information.
    ///
    /// With `implied_port` set the announced port is the UDP source port our
    /// packets arrive from (the right choice behind NATs); otherwise the
    /// node's configured port is announced explicitly.
    pub fn announce_peer(&self, info_hash: InfoHash, implied_port: bool) -> OpStream {
        self.start_op(|tx| Command::Announce {
            info_hash,
            implied_port,
            tx,
        })
    }

    /// Find peers for the info hash.
    pub fn get_peers(&self, info_hash: InfoHash) -> OpStream {
        self.start_op(|tx| Command::GetPeers { info_hash, tx })
    }

    /// Store a BEP44 value on the nodes closest to its target.
    ///
    /// Immutable values are addressed by their content
    /// ([`make_immutable_target`](crate::make_immutable_target)). Mutable
    /// values are signed with this node's key and addressed by its public key
    /// plus the salt. Passing `reset_target` re-publishes whatever the
    /// network currently holds under that target instead of `value`.
    pub fn put_data(
        &self,
        value: Value,
        mutability: Mutability,
        reset_target: Option<InfoHash>,
    ) -> OpStream {
        self.start_op(|tx| Command::PutData {
            value,
            mutability,
            reset_target,
            tx,
        })
    }

    /// Retrieve a BEP44 value. For mutable targets the salt used at
    /// publication must be supplied, otherwise validation cannot reproduce
    /// the target.
    pub fn get_data(&self, target: InfoHash, mutability: Mutability) -> OpStream {
        self.start_op(|tx| Command::GetData {
            target,
            mutability,
            tx,
        })
    }

    /// Stop the node. In-flight operations complete with whatever they
    /// gathered so far.
    pub fn stop(&self) {
        self.tx.send(Command::Shutdown).unwrap_or(());
    }

    fn start_op(&self, command: impl FnOnce(mpsc::UnboundedSender<OpEvent>) -> Command) -> OpStream {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.tx.send(command(tx)).is_err() {
            log::error!("failed to start operation - DhtHandler has shut down");
        }

        OpStream(rx)
    }
}

/// Stream of [`OpEvent`]s for one public operation. Yields value discoveries
/// as they arrive and ends right after the final [`OpEvent::Done`].
#[must_use = "streams do nothing unless polled"]
pub struct OpStream(mpsc::UnboundedReceiver<OpEvent>);

impl Stream for OpStream {
    type Item = OpEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for initializing a DHT.
#[derive(Debug)]
pub struct DhtBuilder {
    port: u16,
    node_id: Option<NodeId>,
    seed: Option<[u8; 32]>,
    bootstrap: Vec<SocketAddrV4>,
    external_ip: Option<Ipv4Addr>,
}

impl DhtBuilder {
    /// UDP port to bind to, 1..=65535. Defaults to 6881. Port 0 is invalid
    /// and surfaces as [`DhtEvent::UdpFail`].
    pub fn set_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the id of this node. If not provided, an id is derived from the
    /// external IP when one is known and generated randomly otherwise.
    pub fn set_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Seed the Ed25519 keypair mutable puts are signed with. Without a seed
    /// a fresh random keypair is generated on every start, which makes
    /// previously published mutable targets unreachable for writing.
    pub fn set_seed(mut self, seed: [u8; 32]) -> Self {
        self.seed = Some(seed);
        self
    }

    /// This node's external IPv4 address, if known. Enables BEP42 node id
    /// derivation.
    pub fn set_external_ip(mut self, ip: Ipv4Addr) -> Self {
        self.external_ip = Some(ip);
        self
    }

    /// Add a location to send the initial find_node round to.
    pub fn add_bootstrap(mut self, addr: SocketAddrV4) -> Self {
        self.bootstrap.push(addr);
        self
    }

    /// Add bootstrap locations in packed form: any number of 6-byte
    /// `ip ∥ port` entries.
    pub fn add_bootstrap_packed(mut self, packed: &[u8]) -> Self {
        self.bootstrap.extend(compact::decode_location_list(packed));
        self
    }

    /// Start a DHT node with the current configuration. The returned stream
    /// carries every observable event the node produces, starting with
    /// [`DhtEvent::Id`] and [`DhtEvent::PublicKey`].
    pub fn start(self) -> (Dht, mpsc::UnboundedReceiver<DhtEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        task::spawn(run(self, command_rx, event_tx));

        (Dht { tx: command_tx }, event_rx)
    }
}

async fn run(
    builder: DhtBuilder,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<DhtEvent>,
) {
    let signing_key = match builder.seed {
        Some(seed) => SigningKey::from_bytes(&seed),
        None => SigningKey::from_bytes(&rand::random()),
    };

    let node_id = builder.node_id.unwrap_or_else(|| match builder.external_ip {
        Some(ip) => NodeId::from_ip_v4(ip),
        None => NodeId::random(),
    });

    event_tx.send(DhtEvent::Id(node_id)).unwrap_or(());
    event_tx
        .send(DhtEvent::PublicKey(signing_key.verifying_key().to_bytes()))
        .unwrap_or(());

    if builder.port == 0 {
        event_tx.send(DhtEvent::UdpFail(0)).unwrap_or(());
        return;
    }

    let socket = match Socket::bind(builder.port).await {
        Ok(socket) => socket,
        Err(error) => {
            log::error!("failed to bind UDP port {}: {}", builder.port, error);
            event_tx.send(DhtEvent::UdpFail(builder.port)).unwrap_or(());
            return;
        }
    };

    let listening = socket
        .local_addr()
        .unwrap_or_else(|_| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, builder.port));
    event_tx.send(DhtEvent::Listening(listening)).unwrap_or(());

    let table = RoutingTable::new(node_id);
    let handler = DhtHandler::new(
        table,
        socket,
        signing_key,
        builder.bootstrap,
        command_rx,
        event_tx,
    );

    handler.run().await;
}
