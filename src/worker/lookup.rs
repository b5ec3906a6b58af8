use super::{LookupSummary, OpEvent};
use crate::{
    bencode::{make_immutable_target, make_mutable_target, signing_buffer, Value, MAX_VALUE_LEN},
    contact::Contact,
    id::InfoHash,
    message::{
        AnnouncePeerRequest, FindNodeRequest, GetPeersRequest, GetRequest, PutRequest, Request,
        Response,
    },
    socket::Socket,
    table::RoutingTable,
    transaction::{PendingQueries, QueryLink},
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_bytes::ByteBuf;
use std::{collections::HashSet, mem, net::SocketAddrV4};
use tokio::sync::mpsc;

/// The well-known public routers answer every find_node with a full block of
/// 16 nodes. They serve bootstrap traffic only and should not be treated as
/// DHT contacts.
const ROUTER_NODE_BLOCK: usize = 16;

/// The slice of handler state a lookup needs to make progress.
pub(crate) struct TaskContext<'a> {
    pub socket: &'a Socket,
    pub pending: &'a mut PendingQueries,
    pub local_id: InfoHash,
}

/// Iterative find_node walk towards a target id.
///
/// Works on a scratch table keyed by the target: every responder is inserted,
/// and every returned node that would land in the scratch table's tip bucket
/// (i.e. is among the closest seen so far) is probed in turn. A location
/// counts as visited on first send, not on reply. The walk is over when no
/// probe is outstanding.
pub(crate) struct Populate {
    table: RoutingTable,
    visited: HashSet<SocketAddrV4>,
    inflight: usize,
}

impl Populate {
    pub fn new(target: InfoHash, seed: &RoutingTable) -> Self {
        Self {
            table: seed.make_temporary(target),
            visited: HashSet::new(),
            inflight: 0,
        }
    }

    /// Probe the contacts of this table closest to the target.
    pub async fn start(&mut self, op_id: u64, ctx: &mut TaskContext<'_>) {
        let seeds: Vec<_> = self
            .table
            .closest()
            .iter()
            .map(|contact| contact.addr())
            .collect();

        for addr in seeds {
            self.probe(op_id, addr, ctx).await;
        }
    }

    /// Probe an explicit seed list (bootstrap).
    pub async fn start_with(
        &mut self,
        op_id: u64,
        seeds: &[SocketAddrV4],
        ctx: &mut TaskContext<'_>,
    ) {
        for addr in seeds {
            self.probe(op_id, *addr, ctx).await;
        }
    }

    async fn probe(&mut self, op_id: u64, addr: SocketAddrV4, ctx: &mut TaskContext<'_>) {
        if !self.visited.insert(addr) {
            return;
        }

        self.inflight += 1;

        let request = Request::FindNode(FindNodeRequest {
            id: ctx.local_id,
            target: self.table.node_id(),
        });
        ctx.pending
            .send(ctx.socket, request, addr, QueryLink::Populate(op_id))
            .await;
    }

    /// Returns true when the walk just finished.
    pub async fn on_response(
        &mut self,
        op_id: u64,
        from: SocketAddrV4,
        response: &Response,
        ctx: &mut TaskContext<'_>,
    ) -> bool {
        self.inflight -= 1;

        if response.nodes.len() != ROUTER_NODE_BLOCK {
            self.table.add(Contact::new(response.id, from));
        }

        let next: Vec<_> = response
            .nodes
            .iter()
            .filter(|node| self.table.in_tip(node.id))
            .map(|node| node.addr)
            .collect();

        for addr in next {
            self.probe(op_id, addr, ctx).await;
        }

        self.is_idle()
    }

    /// Returns true when the walk just finished.
    pub fn on_failure(&mut self) -> bool {
        self.inflight -= 1;
        self.is_idle()
    }

    pub fn is_idle(&self) -> bool {
        self.inflight == 0
    }

    pub fn num_visited(&self) -> usize {
        self.visited.len()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }
}

// ----------------------------------------------------------------------------//

/// The value-retrieval verb an act opens with.
pub(crate) enum PreVerb {
    GetPeers,
    Get,
}

/// The storage verb an act follows up with, once a responder handed us a
/// token.
pub(crate) enum PostPlan {
    Announce { port: u16, implied_port: bool },
    Put(PutPlan),
}

pub(crate) struct PutPlan {
    /// The prepared (already signed) item. `None` in reset mode, where the
    /// item is adopted from whatever the network returns.
    pub item: Option<PutItem>,
    pub cas: Option<i64>,
    pub reset: bool,
}

#[derive(Clone)]
pub(crate) struct PutItem {
    pub v: Value,
    pub k: Option<[u8; 32]>,
    pub seq: Option<i64>,
    pub sig: Option<Vec<u8>>,
}

enum ActStage {
    Populating(Populate),
    Querying { inflight: usize, num_visited: usize },
}

/// A compound operation: iterative lookup, then the pre-verb against the
/// closest contacts found, then (optionally) the post-verb against every
/// responder that supplied a token. Fires its completion exactly once, when
/// the last outstanding query settles.
pub(crate) struct Act {
    target: InfoHash,
    pre: PreVerb,
    post: Option<PostPlan>,
    salt: Option<Vec<u8>>,
    mutable: bool,
    stage: ActStage,
    peers: Vec<SocketAddrV4>,
    peer_seen: HashSet<SocketAddrV4>,
    found: Option<PutItem>,
    num_found: usize,
    num_stored: usize,
    tx: mpsc::UnboundedSender<OpEvent>,
}

impl Act {
    pub fn new(
        target: InfoHash,
        pre: PreVerb,
        post: Option<PostPlan>,
        salt: Option<Vec<u8>>,
        mutable: bool,
        tx: mpsc::UnboundedSender<OpEvent>,
    ) -> Self {
        Self {
            target,
            pre,
            post,
            salt,
            mutable,
            stage: ActStage::Querying {
                inflight: 0,
                num_visited: 0,
            },
            peers: Vec::new(),
            peer_seen: HashSet::new(),
            found: None,
            num_found: 0,
            num_stored: 0,
            tx,
        }
    }

    /// Returns true when the act is already complete (nothing to talk to).
    pub async fn start(
        &mut self,
        op_id: u64,
        seed: &RoutingTable,
        ctx: &mut TaskContext<'_>,
    ) -> bool {
        let mut populate = Populate::new(self.target, seed);
        populate.start(op_id, ctx).await;

        if populate.is_idle() {
            self.begin_query(populate, op_id, ctx).await
        } else {
            self.stage = ActStage::Populating(populate);
            false
        }
    }

    pub async fn on_populate_response(
        &mut self,
        op_id: u64,
        from: SocketAddrV4,
        response: &Response,
        ctx: &mut TaskContext<'_>,
    ) -> bool {
        let ActStage::Populating(populate) = &mut self.stage else {
            return false;
        };

        if populate.on_response(op_id, from, response, ctx).await {
            self.enter_query_stage(op_id, ctx).await
        } else {
            false
        }
    }

    pub async fn on_populate_failure(&mut self, op_id: u64, ctx: &mut TaskContext<'_>) -> bool {
        let ActStage::Populating(populate) = &mut self.stage else {
            return false;
        };

        if populate.on_failure() {
            self.enter_query_stage(op_id, ctx).await
        } else {
            false
        }
    }

    async fn enter_query_stage(&mut self, op_id: u64, ctx: &mut TaskContext<'_>) -> bool {
        let placeholder = ActStage::Querying {
            inflight: 0,
            num_visited: 0,
        };
        let ActStage::Populating(populate) = mem::replace(&mut self.stage, placeholder) else {
            unreachable!()
        };

        self.begin_query(populate, op_id, ctx).await
    }

    /// Send the pre-verb to the tip contacts of the populated scratch table.
    /// Returns true when there are none and the act is complete.
    async fn begin_query(
        &mut self,
        populate: Populate,
        op_id: u64,
        ctx: &mut TaskContext<'_>,
    ) -> bool {
        let num_visited = populate.num_visited();
        let mut inflight = 0;

        for contact in populate.table().closest() {
            let request = match self.pre {
                PreVerb::GetPeers => Request::GetPeers(GetPeersRequest {
                    id: ctx.local_id,
                    info_hash: self.target,
                }),
                PreVerb::Get => Request::Get(GetRequest {
                    id: ctx.local_id,
                    seq: None,
                    target: self.target,
                }),
            };

            ctx.pending
                .send(ctx.socket, request, contact.addr(), QueryLink::Pre(op_id))
                .await;
            inflight += 1;
        }

        self.stage = ActStage::Querying {
            inflight,
            num_visited,
        };

        inflight == 0
    }

    /// Returns true when this was the last outstanding query.
    pub async fn on_pre_response(
        &mut self,
        op_id: u64,
        from: SocketAddrV4,
        response: &Response,
        ctx: &mut TaskContext<'_>,
    ) -> bool {
        match self.pre {
            PreVerb::GetPeers => self.accept_peers(response, from),
            PreVerb::Get => self.accept_data(response, from),
        }

        // A token unlocks the follow-up storage verb on this responder.
        let follow_up = match (&response.token, &self.post) {
            (Some(token), Some(_)) => self.plan_post(token.clone(), ctx.local_id),
            _ => None,
        };

        let mut sent = 0;
        if let Some(request) = follow_up {
            ctx.pending
                .send(ctx.socket, request, from, QueryLink::Post(op_id))
                .await;
            sent = 1;
        }

        let ActStage::Querying { inflight, .. } = &mut self.stage else {
            return false;
        };
        *inflight = *inflight - 1 + sent;
        *inflight == 0
    }

    /// Returns true when this was the last outstanding query.
    pub fn on_post_response(&mut self) -> bool {
        self.num_stored += 1;
        self.on_query_failure()
    }

    /// A pre or post query timed out or errored. Returns true when it was the
    /// last outstanding one.
    pub fn on_query_failure(&mut self) -> bool {
        let ActStage::Querying { inflight, .. } = &mut self.stage else {
            return false;
        };
        *inflight -= 1;
        *inflight == 0
    }

    fn accept_peers(&mut self, response: &Response, from: SocketAddrV4) {
        if response.values.is_empty() {
            return;
        }

        for addr in &response.values {
            if self.peer_seen.insert(*addr) {
                self.peers.push(*addr);
            }
        }

        self.tx
            .send(OpEvent::Peers {
                info_hash: self.target,
                values: response.values.clone(),
                from,
            })
            .unwrap_or(());
    }

    fn accept_data(&mut self, response: &Response, from: SocketAddrV4) {
        let Some(v) = &response.v else {
            return;
        };

        if v.to_bytes().len() > MAX_VALUE_LEN {
            return;
        }

        let valid = if self.mutable {
            self.accept_mutable_data(v, response)
        } else {
            self.accept_immutable_data(v)
        };

        if valid {
            self.tx
                .send(OpEvent::Data {
                    target: self.target,
                    value: v.clone(),
                    from,
                })
                .unwrap_or(());
        }
    }

    fn accept_mutable_data(&mut self, v: &Value, response: &Response) -> bool {
        let Some(k) = response
            .k
            .as_ref()
            .and_then(|k| <[u8; 32]>::try_from(&k[..]).ok())
        else {
            return false;
        };
        let Some(seq) = response.seq.filter(|seq| *seq >= 0) else {
            return false;
        };
        let Some(sig) = response
            .sig
            .as_ref()
            .and_then(|sig| <[u8; 64]>::try_from(&sig[..]).ok())
        else {
            return false;
        };

        if make_mutable_target(&k, self.salt.as_deref()) != self.target {
            return false;
        }

        let Ok(key) = VerifyingKey::from_bytes(&k) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig);
        let message = signing_buffer(seq, v, self.salt.as_deref());
        if key.verify(&message, &signature).is_err() {
            return false;
        }

        let item = PutItem {
            v: v.clone(),
            k: Some(k),
            seq: Some(seq),
            sig: Some(sig.to_vec()),
        };

        match &self.found {
            None => {
                self.found = Some(item);
                self.num_found = 1;
            }
            Some(current) => {
                let current_seq = current.seq.unwrap_or(-1);
                if seq > current_seq {
                    self.found = Some(item);
                    self.num_found = 1;
                } else if seq == current_seq {
                    self.num_found += 1;
                }
            }
        }

        true
    }

    fn accept_immutable_data(&mut self, v: &Value) -> bool {
        if make_immutable_target(v) != self.target {
            return false;
        }

        if self.found.is_none() {
            self.found = Some(PutItem {
                v: v.clone(),
                k: None,
                seq: None,
                sig: None,
            });
            self.num_found = 1;
        } else {
            self.num_found += 1;
        }

        true
    }

    fn plan_post(&self, token: ByteBuf, local_id: InfoHash) -> Option<Request> {
        match self.post.as_ref()? {
            PostPlan::Announce { port, implied_port } => {
                Some(Request::AnnouncePeer(AnnouncePeerRequest {
                    id: local_id,
                    implied_port: implied_port.then_some(1),
                    info_hash: self.target,
                    port: (!implied_port).then_some(*port),
                    token,
                }))
            }
            PostPlan::Put(plan) => {
                let (item, cas) = if plan.reset {
                    // Nothing discovered yet means nothing to re-publish.
                    let found = self.found.clone()?;
                    let cas = found.seq;
                    (found, cas)
                } else {
                    (plan.item.clone()?, plan.cas)
                };

                Some(Request::Put(PutRequest {
                    cas,
                    id: local_id,
                    k: item.k.map(|k| ByteBuf::from(k.to_vec())),
                    salt: self.salt.clone().map(ByteBuf::from),
                    seq: item.seq,
                    sig: item.sig.map(ByteBuf::from),
                    token,
                    v: item.v,
                }))
            }
        }
    }

    /// Deliver the aggregate result. Consumes the act; dropping the sender
    /// afterwards ends the operation's stream.
    pub fn finish(self) {
        let num_visited = match &self.stage {
            ActStage::Querying { num_visited, .. } => *num_visited,
            ActStage::Populating(populate) => populate.num_visited(),
        };

        let mut summary = LookupSummary {
            target: Some(self.target),
            num_visited,
            ..LookupSummary::default()
        };

        match self.pre {
            PreVerb::GetPeers => {
                summary.num_found = Some(self.peers.len());
                summary.peers = Some(self.peers);
            }
            PreVerb::Get => {
                summary.num_found = Some(self.num_found);
                summary.salt = self.salt;

                let item = match &self.post {
                    // What we pushed out, for fresh puts.
                    Some(PostPlan::Put(plan)) if !plan.reset => plan.item.clone(),
                    // What the network gave us, for gets and reset puts.
                    _ => self.found,
                };

                if let Some(item) = item {
                    summary.value = Some(item.v);
                    summary.seq = item.seq;
                    summary.public_key = item.k;
                    summary.signature = item.sig;
                }
            }
        }

        if self.post.is_some() {
            summary.num_stored = Some(self.num_stored);
        }

        self.tx.send(OpEvent::Done(summary)).unwrap_or(());
    }
}
