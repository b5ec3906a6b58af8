use super::{
    lookup::{Act, Populate, PostPlan, PreVerb, PutItem, PutPlan, TaskContext},
    Command, DhtEvent, LookupSummary, Mutability, OpEvent,
};
use crate::{
    bencode::{
        self, make_immutable_target, make_mutable_target, signing_buffer, MAX_SALT_LEN,
        MAX_VALUE_LEN,
    },
    contact::{unix_seconds, Contact, ContactInfo},
    id::InfoHash,
    message::{
        error_code, Message, MessageBody, PingRequest, PutRequest, RawMessage, Request, Response,
        KNOWN_VERBS,
    },
    socket::{Socket, SpamShield, SpamVerdict},
    storage::{DataStore, PeerStore, StoredItem},
    table::RoutingTable,
    token::TokenStore,
    transaction::{parse_tid, PendingQueries, QueryLink, TICK_INTERVAL},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_bytes::ByteBuf;
use std::{collections::HashMap, net::SocketAddrV4, time::Duration};
use tokio::{select, sync::mpsc, time};

/// Drives secret rotation, spam reset, table refresh and store expiry.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often an empty-handed bootstrap is retried.
const MAX_BOOTSTRAP_ATTEMPTS: usize = 3;

/// An in-flight operation, dispatched to by the links of its outstanding
/// queries.
enum Op {
    Bootstrap { populate: Populate, attempts: usize },
    Act(Box<Act>),
}

/// Storage for our event loop to invoke actions upon. Owns every piece of DHT
/// state; all mutation happens on this task.
pub(crate) struct DhtHandler {
    running: bool,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<DhtEvent>,
    socket: Socket,
    local_port: u16,
    signing_key: SigningKey,
    table: RoutingTable,
    pending: PendingQueries,
    peer_store: PeerStore,
    data_store: DataStore,
    token_store: TokenStore,
    spam: SpamShield,
    bootstrap_seeds: Vec<SocketAddrV4>,
    ops: HashMap<u64, Op>,
    next_op_id: u64,
}

impl DhtHandler {
    pub fn new(
        table: RoutingTable,
        socket: Socket,
        signing_key: SigningKey,
        bootstrap_seeds: Vec<SocketAddrV4>,
        command_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<DhtEvent>,
    ) -> Self {
        let local_port = socket.local_port().unwrap_or(0);

        Self {
            running: true,
            command_rx,
            event_tx,
            socket,
            local_port,
            signing_key,
            table,
            pending: PendingQueries::new(),
            peer_store: PeerStore::new(),
            data_store: DataStore::new(),
            token_store: TokenStore::new(),
            spam: SpamShield::new(),
            bootstrap_seeds,
            ops: HashMap::new(),
            next_op_id: 0,
        }
    }

    pub async fn run(mut self) {
        self.start_bootstrap(1).await;

        let mut query_tick = time::interval_at(
            time::Instant::now() + TICK_INTERVAL, //
            TICK_INTERVAL,
        );
        let mut housekeeping = time::interval_at(
            time::Instant::now() + HOUSEKEEPING_INTERVAL,
            HOUSEKEEPING_INTERVAL,
        );

        while self.running {
            select! {
                _ = query_tick.tick() => self.handle_query_tick().await,
                _ = housekeeping.tick() => self.handle_housekeeping().await,
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => self.shutdown().await,
                    }
                }
                result = self.socket.recv() => {
                    match result {
                        Ok((buffer, from)) => self.handle_incoming(&buffer, from).await,
                        Err(error) => log::error!("failed to receive datagram: {error}"),
                    }
                }
            }
        }
    }

    fn emit(&self, event: DhtEvent) {
        self.event_tx.send(event).unwrap_or(());
    }

    fn alloc_op_id(&mut self) -> u64 {
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        op_id
    }

    /// Up to a bucket's worth of contacts closest to an arbitrary target.
    fn closest_to(&self, target: InfoHash) -> Vec<ContactInfo> {
        self.table
            .make_temporary(target)
            .closest()
            .iter()
            .map(|contact| contact.info)
            .collect()
    }

    // ------------------------------------------------------------------//
    // bootstrap

    async fn start_bootstrap(&mut self, mut attempts: usize) {
        loop {
            let seeds = self.bootstrap_seeds.clone();
            let op_id = self.alloc_op_id();
            let local_id = self.table.node_id();
            let mut populate = Populate::new(local_id, &self.table);

            {
                let mut ctx = TaskContext {
                    socket: &self.socket,
                    pending: &mut self.pending,
                    local_id,
                };
                populate.start_with(op_id, &seeds, &mut ctx).await;
            }

            if !populate.is_idle() {
                self.ops.insert(op_id, Op::Bootstrap { populate, attempts });
                return;
            }

            if self.should_rebootstrap() && attempts < MAX_BOOTSTRAP_ATTEMPTS {
                attempts += 1;
                continue;
            }

            self.emit_ready(populate.num_visited());
            return;
        }
    }

    async fn bootstrap_done(&mut self, populate: Populate, attempts: usize) {
        if self.should_rebootstrap() && attempts < MAX_BOOTSTRAP_ATTEMPTS {
            log::debug!("bootstrap attempt {attempts} found no nodes, retrying");
            self.start_bootstrap(attempts + 1).await;
        } else {
            self.emit_ready(populate.num_visited());
        }
    }

    fn should_rebootstrap(&self) -> bool {
        self.table.all().is_empty() && !self.bootstrap_seeds.is_empty()
    }

    fn emit_ready(&self, num_visited: usize) {
        self.emit(DhtEvent::Ready { num_visited });
        self.emit(DhtEvent::Nodes(self.table.all()));
        self.emit(DhtEvent::Closest(self.table.closest()));
    }

    // ------------------------------------------------------------------//
    // public operations

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Announce {
                info_hash,
                implied_port,
                tx,
            } => {
                let post = PostPlan::Announce {
                    port: self.local_port,
                    implied_port,
                };
                self.start_act(info_hash, PreVerb::GetPeers, Some(post), None, false, tx)
                    .await;
            }
            Command::GetPeers { info_hash, tx } => {
                self.start_act(info_hash, PreVerb::GetPeers, None, None, false, tx)
                    .await;
            }
            Command::GetData {
                target,
                mutability,
                tx,
            } => {
                self.start_act(
                    target,
                    PreVerb::Get,
                    None,
                    mutability.salt(),
                    mutability.is_mutable(),
                    tx,
                )
                .await;
            }
            Command::PutData {
                value,
                mutability,
                reset_target,
                tx,
            } => self.handle_put_data(value, mutability, reset_target, tx).await,
            Command::Shutdown => self.shutdown().await,
        }
    }

    async fn handle_put_data(
        &mut self,
        value: bencode::Value,
        mutability: Mutability,
        reset_target: Option<InfoHash>,
        tx: mpsc::UnboundedSender<OpEvent>,
    ) {
        let salt = mutability.salt();

        let (target, plan) = match (&mutability, reset_target) {
            (Mutability::Mutable(_), Some(target)) => {
                // Reset: re-publish whatever the network still holds under
                // this target, bumping its CAS. The passed value is unused.
                let plan = PutPlan {
                    item: None,
                    cas: None,
                    reset: true,
                };
                (target, plan)
            }
            (Mutability::Mutable(_), None) => {
                if value.to_bytes().len() > MAX_VALUE_LEN {
                    return fail_put(tx, None);
                }

                let seq = unix_seconds() as i64;
                let public_key = self.signing_key.verifying_key().to_bytes();
                let signature = self
                    .signing_key
                    .sign(&signing_buffer(seq, &value, salt.as_deref()));
                let target = make_mutable_target(&public_key, salt.as_deref());

                let plan = PutPlan {
                    item: Some(PutItem {
                        v: value,
                        k: Some(public_key),
                        seq: Some(seq),
                        sig: Some(signature.to_bytes().to_vec()),
                    }),
                    cas: None,
                    reset: false,
                };
                (target, plan)
            }
            (Mutability::Immutable, _) => {
                if value.to_bytes().len() > MAX_VALUE_LEN {
                    return fail_put(tx, None);
                }

                let target = make_immutable_target(&value);
                let plan = PutPlan {
                    item: Some(PutItem {
                        v: value,
                        k: None,
                        seq: None,
                        sig: None,
                    }),
                    cas: None,
                    reset: false,
                };
                (target, plan)
            }
        };

        self.start_act(
            target,
            PreVerb::Get,
            Some(PostPlan::Put(plan)),
            salt,
            mutability.is_mutable(),
            tx,
        )
        .await;
    }

    async fn start_act(
        &mut self,
        target: InfoHash,
        pre: PreVerb,
        post: Option<PostPlan>,
        salt: Option<Vec<u8>>,
        mutable: bool,
        tx: mpsc::UnboundedSender<OpEvent>,
    ) {
        let op_id = self.alloc_op_id();
        let local_id = self.table.node_id();
        let mut act = Act::new(target, pre, post, salt, mutable, tx);

        let done = {
            let mut ctx = TaskContext {
                socket: &self.socket,
                pending: &mut self.pending,
                local_id,
            };
            act.start(op_id, &self.table, &mut ctx).await
        };

        if done {
            act.finish();
        } else {
            self.ops.insert(op_id, Op::Act(Box::new(act)));
        }
    }

    // ------------------------------------------------------------------//
    // outgoing query settlement

    async fn handle_query_tick(&mut self) {
        let expired = self.pending.tick(&self.socket).await;

        for link in expired {
            self.dispatch_failure(link).await;
        }
    }

    async fn dispatch_success(&mut self, link: QueryLink, from: SocketAddrV4, response: Response) {
        let local_id = self.table.node_id();

        match link {
            QueryLink::Ping => (),
            QueryLink::Populate(op_id) => {
                let Some(op) = self.ops.remove(&op_id) else {
                    return;
                };

                match op {
                    Op::Bootstrap {
                        mut populate,
                        attempts,
                    } => {
                        let done = {
                            let mut ctx = TaskContext {
                                socket: &self.socket,
                                pending: &mut self.pending,
                                local_id,
                            };
                            populate.on_response(op_id, from, &response, &mut ctx).await
                        };

                        if done {
                            self.bootstrap_done(populate, attempts).await;
                        } else {
                            self.ops.insert(op_id, Op::Bootstrap { populate, attempts });
                        }
                    }
                    Op::Act(mut act) => {
                        let done = {
                            let mut ctx = TaskContext {
                                socket: &self.socket,
                                pending: &mut self.pending,
                                local_id,
                            };
                            act.on_populate_response(op_id, from, &response, &mut ctx)
                                .await
                        };

                        if done {
                            act.finish();
                        } else {
                            self.ops.insert(op_id, Op::Act(act));
                        }
                    }
                }
            }
            QueryLink::Pre(op_id) => {
                let Some(Op::Act(mut act)) = self.ops.remove(&op_id) else {
                    return;
                };

                let done = {
                    let mut ctx = TaskContext {
                        socket: &self.socket,
                        pending: &mut self.pending,
                        local_id,
                    };
                    act.on_pre_response(op_id, from, &response, &mut ctx).await
                };

                if done {
                    act.finish();
                } else {
                    self.ops.insert(op_id, Op::Act(act));
                }
            }
            QueryLink::Post(op_id) => {
                let Some(Op::Act(mut act)) = self.ops.remove(&op_id) else {
                    return;
                };

                if act.on_post_response() {
                    act.finish();
                } else {
                    self.ops.insert(op_id, Op::Act(act));
                }
            }
        }
    }

    async fn dispatch_failure(&mut self, link: QueryLink) {
        let local_id = self.table.node_id();

        match link {
            QueryLink::Ping => (),
            QueryLink::Populate(op_id) => {
                let Some(op) = self.ops.remove(&op_id) else {
                    return;
                };

                match op {
                    Op::Bootstrap {
                        mut populate,
                        attempts,
                    } => {
                        if populate.on_failure() {
                            self.bootstrap_done(populate, attempts).await;
                        } else {
                            self.ops.insert(op_id, Op::Bootstrap { populate, attempts });
                        }
                    }
                    Op::Act(mut act) => {
                        let done = {
                            let mut ctx = TaskContext {
                                socket: &self.socket,
                                pending: &mut self.pending,
                                local_id,
                            };
                            act.on_populate_failure(op_id, &mut ctx).await
                        };

                        if done {
                            act.finish();
                        } else {
                            self.ops.insert(op_id, Op::Act(act));
                        }
                    }
                }
            }
            QueryLink::Pre(op_id) | QueryLink::Post(op_id) => {
                let Some(Op::Act(mut act)) = self.ops.remove(&op_id) else {
                    return;
                };

                if act.on_query_failure() {
                    act.finish();
                } else {
                    self.ops.insert(op_id, Op::Act(act));
                }
            }
        }
    }

    // ------------------------------------------------------------------//
    // incoming

    async fn handle_incoming(&mut self, buffer: &[u8], from: SocketAddrV4) {
        match self.spam.check(from) {
            SpamVerdict::Allow => (),
            SpamVerdict::JustBlocked => {
                self.emit(DhtEvent::Spam(from));
                return;
            }
            SpamVerdict::Blocked => return,
        }

        let message = match Message::decode(buffer) {
            Ok(message) => message,
            Err(_) => {
                self.reply_to_malformed(buffer, from).await;
                return;
            }
        };

        match message.body {
            MessageBody::Request(request) => {
                self.handle_request(message.transaction_id, request, from)
                    .await;
            }
            MessageBody::Response(envelope) => {
                let Some(tid) = parse_tid(&message.transaction_id) else {
                    return;
                };
                let Some(link) = self.pending.claim(tid, from) else {
                    log::debug!("unsolicited response from {from}");
                    return;
                };

                let response = envelope.r;
                self.table.add(Contact::new(response.id, from));
                self.dispatch_success(link, from, response).await;
            }
            MessageBody::Error(envelope) => {
                let Some(tid) = parse_tid(&message.transaction_id) else {
                    return;
                };
                let Some(link) = self.pending.claim(tid, from) else {
                    return;
                };

                let error = envelope.e;
                self.emit(DhtEvent::Error {
                    code: error.code,
                    message: error.message,
                    from,
                });
                self.dispatch_failure(link).await;
            }
        }
    }

    /// The message did not decode. If it still looks like a query with a
    /// usable transaction id, answer with a coded error; otherwise drop it.
    async fn reply_to_malformed(&mut self, buffer: &[u8], from: SocketAddrV4) {
        let Ok(raw) = bencode::decode::<RawMessage>(buffer) else {
            return;
        };

        if raw.transaction_id.is_empty() || raw.y.as_ref().map(|y| &y[..]) != Some(&b"q"[..]) {
            return;
        }

        let known_verb = raw
            .q
            .as_ref()
            .and_then(|q| std::str::from_utf8(q).ok())
            .map(|q| KNOWN_VERBS.contains(&q))
            .unwrap_or(false);

        let (code, reason) = if known_verb {
            (error_code::PROTOCOL_ERROR, "protocol error")
        } else {
            (error_code::METHOD_UNKNOWN, "method unknown")
        };

        self.send_error(raw.transaction_id, code, reason, from).await;
    }

    async fn handle_request(&mut self, tid: ByteBuf, request: Request, from: SocketAddrV4) {
        self.emit(DhtEvent::Incoming {
            query: request.verb(),
            from,
        });

        let local_id = self.table.node_id();
        let sender = ContactInfo::new(request.node_id(), from);

        // The sender is a live node; let the table know about it.
        self.table.add(Contact::new(sender.id, from));

        match request {
            Request::Ping(_) => {
                self.send_response(tid, Response::with_id(local_id), from)
                    .await;
            }
            Request::FindNode(request) => {
                let response = Response {
                    nodes: self.closest_to(request.target),
                    ..Response::with_id(local_id)
                };
                self.send_response(tid, response, from).await;
            }
            Request::GetPeers(request) => {
                let token = ByteBuf::from(self.token_store.checkout(&sender).to_vec());
                let values = self.peer_store.find(&request.info_hash);

                let response = if values.is_empty() {
                    Response {
                        nodes: self.closest_to(request.info_hash),
                        token: Some(token),
                        ..Response::with_id(local_id)
                    }
                } else {
                    Response {
                        token: Some(token),
                        values,
                        ..Response::with_id(local_id)
                    }
                };
                self.send_response(tid, response, from).await;
            }
            Request::AnnouncePeer(request) => {
                if !self.token_store.checkin(&sender, &request.token) {
                    self.send_error(tid, error_code::PROTOCOL_ERROR, "invalid token", from)
                        .await;
                    return;
                }

                let Some(peer) = request.peer_addr(from) else {
                    self.send_error(tid, error_code::PROTOCOL_ERROR, "port missing", from)
                        .await;
                    return;
                };

                // Only hold announces addressed near our own id. Announces
                // outside our neighborhood are acknowledged but not stored.
                if request.info_hash.same_storage_prefix(&local_id) {
                    self.peer_store.insert(request.info_hash, peer);
                }

                self.send_response(tid, Response::with_id(local_id), from)
                    .await;
            }
            Request::Get(request) => {
                let token = ByteBuf::from(self.token_store.checkout(&sender).to_vec());
                let mut response = Response {
                    nodes: self.closest_to(request.target),
                    token: Some(token),
                    ..Response::with_id(local_id)
                };

                if let Some(item) = self.data_store.get(&request.target) {
                    let newer = match (request.seq, item.seq) {
                        (Some(have), Some(stored)) => stored > have,
                        _ => true,
                    };

                    if newer {
                        response.v = Some(item.v.clone());
                        response.k = item.k.map(|k| ByteBuf::from(k.to_vec()));
                        response.seq = item.seq;
                        response.sig = item.sig.clone().map(ByteBuf::from);
                    }
                }

                self.send_response(tid, response, from).await;
            }
            Request::Put(request) => {
                self.handle_put(tid, request, sender, from).await;
            }
        }
    }

    async fn handle_put(
        &mut self,
        tid: ByteBuf,
        request: PutRequest,
        sender: ContactInfo,
        from: SocketAddrV4,
    ) {
        let local_id = self.table.node_id();

        if !self.token_store.checkin(&sender, &request.token) {
            self.send_error(tid, error_code::PROTOCOL_ERROR, "invalid token", from)
                .await;
            return;
        }

        let encoded = request.v.to_bytes();
        if encoded.len() > MAX_VALUE_LEN {
            self.send_error(
                tid,
                error_code::MESSAGE_TOO_BIG,
                "message (v field) too big",
                from,
            )
            .await;
            return;
        }

        let mutable = match (&request.k, request.seq, &request.sig) {
            (Some(k), Some(seq), Some(sig)) => Some((k, seq, sig)),
            (None, None, None) => None,
            _ => {
                self.send_error(
                    tid,
                    error_code::PROTOCOL_ERROR,
                    "k, seq and sig must be given together",
                    from,
                )
                .await;
                return;
            }
        };

        let Some((k, seq, sig)) = mutable else {
            // Immutable path: the value is its own address.
            let target = InfoHash::sha1(&encoded);
            if target.same_storage_prefix(&local_id) {
                self.data_store.insert(target, StoredItem::immutable(request.v));
            }
            self.send_response(tid, Response::with_id(local_id), from)
                .await;
            return;
        };

        let Ok(public_key) = <[u8; 32]>::try_from(&k[..]) else {
            self.send_error(tid, error_code::PROTOCOL_ERROR, "invalid k length", from)
                .await;
            return;
        };
        let Ok(signature) = <[u8; 64]>::try_from(&sig[..]) else {
            self.send_error(tid, error_code::PROTOCOL_ERROR, "invalid sig length", from)
                .await;
            return;
        };
        if seq < 0 {
            self.send_error(tid, error_code::PROTOCOL_ERROR, "negative seq", from)
                .await;
            return;
        }

        let salt = request
            .salt
            .as_ref()
            .map(|salt| &salt[..])
            .filter(|salt| !salt.is_empty());

        let verified = VerifyingKey::from_bytes(&public_key)
            .ok()
            .map(|key| {
                let message = signing_buffer(seq, &request.v, salt);
                key.verify(&message, &Signature::from_bytes(&signature))
                    .is_ok()
            })
            .unwrap_or(false);
        if !verified {
            self.send_error(tid, error_code::INVALID_SIGNATURE, "invalid signature", from)
                .await;
            return;
        }

        if salt.map(|salt| salt.len()).unwrap_or(0) > MAX_SALT_LEN {
            self.send_error(tid, error_code::SALT_TOO_BIG, "salt too big", from)
                .await;
            return;
        }

        let target = make_mutable_target(&public_key, salt);
        if !target.same_storage_prefix(&local_id) {
            self.send_response(tid, Response::with_id(local_id), from)
                .await;
            return;
        }

        if let Some(stored) = self.data_store.get(&target) {
            let stored_seq = stored.seq.unwrap_or(-1);

            if let Some(cas) = request.cas {
                if cas != stored_seq {
                    self.send_error(tid, error_code::CAS_MISMATCH, "CAS mismatch", from)
                        .await;
                    return;
                }
            }

            if stored_seq > seq {
                self.send_error(
                    tid,
                    error_code::SEQ_TOO_SMALL,
                    "sequence number less than current",
                    from,
                )
                .await;
                return;
            }

            if stored_seq == seq && stored.v.to_bytes() != encoded {
                self.send_error(
                    tid,
                    error_code::SEQ_TOO_SMALL,
                    "sequence number not incremented",
                    from,
                )
                .await;
                return;
            }
        }

        self.data_store.insert(
            target,
            StoredItem::mutable(request.v, public_key, seq, signature.to_vec()),
        );
        self.send_response(tid, Response::with_id(local_id), from)
            .await;
    }

    async fn send_response(&self, tid: ByteBuf, response: Response, dest: SocketAddrV4) {
        let message = Message::reply(tid, response);

        if let Err(error) = self.socket.send(&message.encode(), dest).await {
            log::debug!("failed to send response to {dest}: {error}");
        }
    }

    async fn send_error(&self, tid: ByteBuf, code: u16, reason: &str, dest: SocketAddrV4) {
        let message = Message::reject(tid, code, reason);

        if let Err(error) = self.socket.send(&message.encode(), dest).await {
            log::debug!("failed to send error to {dest}: {error}");
        }
    }

    // ------------------------------------------------------------------//
    // housekeeping

    async fn handle_housekeeping(&mut self) {
        self.spam.clear();
        self.token_store.rotate();

        let outcome = self.table.refresh();
        for contact in outcome.dropped {
            self.emit(DhtEvent::DropNode(contact));
        }

        let local_id = self.table.node_id();
        for contact in outcome.ping {
            let request = Request::Ping(PingRequest { id: local_id });
            self.pending
                .send(&self.socket, request, contact.addr(), QueryLink::Ping)
                .await;
        }

        let now = unix_seconds();

        for (info_hash, addr) in self.peer_store.sweep(now) {
            self.emit(DhtEvent::DropPeer { info_hash, addr });
        }
        self.emit(DhtEvent::Peers {
            torrents: self.peer_store.num_torrents(),
            peers: self.peer_store.num_peers(),
        });

        for target in self.data_store.sweep(now) {
            self.emit(DhtEvent::DropData(target));
        }
        self.emit(DhtEvent::Data {
            items: self.data_store.len(),
        });
    }

    /// Fail everything in flight (operations complete with whatever they
    /// gathered) and leave the event loop. Dropping the handler closes the
    /// socket.
    async fn shutdown(&mut self) {
        // Failing a populate can start an act's query round, which enqueues
        // new queries; drain until nothing is left.
        loop {
            let links = self.pending.drain();
            if links.is_empty() {
                break;
            }

            for link in links {
                self.dispatch_failure(link).await;
            }
        }

        self.running = false;
    }
}

/// Complete a put operation that never made it onto the wire.
fn fail_put(tx: mpsc::UnboundedSender<OpEvent>, target: Option<InfoHash>) {
    log::warn!("put_data value exceeds {MAX_VALUE_LEN} encoded bytes, not publishing");

    tx.send(OpEvent::Done(LookupSummary {
        target,
        num_stored: Some(0),
        ..LookupSummary::default()
    }))
    .unwrap_or(());
}
