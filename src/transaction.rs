//! Outgoing query bookkeeping.
//!
//! Every query we send gets a 16-bit transaction id and a slot in the pending
//! table. The table is capped; overflowing queries park in a FIFO queue and
//! are promoted as slots free up. A 100 ms tick drives the timeout sweep:
//! each pending entry has a budget of [`TICK_BUDGET`] ticks, after which the
//! query is considered failed and its owning operation is notified exactly
//! once.

use crate::{
    message::{Message, Request},
    socket::Socket,
};
use serde_bytes::ByteBuf;
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddrV4,
    time::Duration,
};

/// How often the timeout sweep runs.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Ticks before a pending query is failed.
pub(crate) const TICK_BUDGET: u8 = 5;

/// Maximum number of queries in flight at once.
pub(crate) const MAX_PENDING: usize = 20;

/// Which operation an outgoing query belongs to, so its response (or timeout)
/// can be routed back.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum QueryLink {
    /// A find_node sent by an iterative populate.
    Populate(u64),
    /// The value-retrieval verb of an act (get_peers/get).
    Pre(u64),
    /// The storage verb of an act (announce_peer/put).
    Post(u64),
    /// A refresh liveness ping; nobody waits on the outcome.
    Ping,
}

struct PendingQuery {
    dest: SocketAddrV4,
    link: QueryLink,
    ticks_left: u8,
}

struct WaitingQuery {
    request: Request,
    dest: SocketAddrV4,
    link: QueryLink,
}

pub(crate) struct PendingQueries {
    next_tid: u16,
    pending: HashMap<u16, PendingQuery>,
    waiting: VecDeque<WaitingQuery>,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self {
            next_tid: rand::random(),
            pending: HashMap::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Send a query, or park it if the pending table is full. Either way the
    /// linked operation will hear back exactly once.
    pub async fn send(
        &mut self,
        socket: &Socket,
        request: Request,
        dest: SocketAddrV4,
        link: QueryLink,
    ) {
        if self.pending.len() < MAX_PENDING {
            self.dispatch(socket, request, dest, link).await;
        } else {
            self.waiting.push_back(WaitingQuery {
                request,
                dest,
                link,
            });
        }
    }

    async fn dispatch(
        &mut self,
        socket: &Socket,
        request: Request,
        dest: SocketAddrV4,
        link: QueryLink,
    ) {
        let tid = self.alloc_tid();

        let message = Message::query(ByteBuf::from(tid.to_be_bytes().to_vec()), request);

        if let Err(error) = socket.send(&message.encode(), dest).await {
            // The timeout sweep will deliver the failure.
            log::debug!("failed to send query to {dest}: {error}");
        }

        self.pending.insert(
            tid,
            PendingQuery {
                dest,
                link,
                ticks_left: TICK_BUDGET,
            },
        );
    }

    /// Ids wrap at 65536; skip over ids that still have a query in flight.
    fn alloc_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);

            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }

    /// One 100 ms sweep: age out expired queries (returning their links for
    /// failure delivery) and promote waiting queries into freed slots.
    pub async fn tick(&mut self, socket: &Socket) -> Vec<QueryLink> {
        let mut expired = Vec::new();

        self.pending.retain(|_, query| {
            query.ticks_left -= 1;

            if query.ticks_left == 0 {
                expired.push(query.link);
                false
            } else {
                true
            }
        });

        while self.pending.len() < MAX_PENDING {
            let Some(waiting) = self.waiting.pop_front() else {
                break;
            };
            self.dispatch(socket, waiting.request, waiting.dest, waiting.link)
                .await;
        }

        expired
    }

    /// Match a response to its pending query. The response must come from the
    /// address the query went to; anything else leaves the entry in place.
    pub fn claim(&mut self, tid: u16, from: SocketAddrV4) -> Option<QueryLink> {
        match self.pending.get(&tid) {
            Some(query) if query.dest == from => self.pending.remove(&tid).map(|query| query.link),
            _ => None,
        }
    }

    /// Fail everything, pending and waiting. Used on shutdown.
    pub fn drain(&mut self) -> Vec<QueryLink> {
        let mut links: Vec<_> = self.pending.drain().map(|(_, query)| query.link).collect();
        links.extend(self.waiting.drain(..).map(|waiting| waiting.link));
        links
    }

    #[cfg(test)]
    fn num_pending(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn num_waiting(&self) -> usize {
        self.waiting.len()
    }
}

/// Transaction ids as they appear on the wire: 1 or 2 bytes, big-endian.
pub(crate) fn parse_tid(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [single] => Some(*single as u16),
        [high, low] => Some(u16::from_be_bytes([*high, *low])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{id::NodeId, message::PingRequest, test};

    fn ping_request() -> Request {
        Request::Ping(PingRequest {
            id: NodeId::random(),
        })
    }

    #[tokio::test]
    async fn overflow_parks_in_fifo() {
        let socket = Socket::bind(0).await.unwrap();
        let mut queries = PendingQueries::new();
        let dest = test::dummy_socket_addr_v4();

        for _ in 0..MAX_PENDING + 3 {
            queries
                .send(&socket, ping_request(), dest, QueryLink::Ping)
                .await;
        }

        assert_eq!(queries.num_pending(), MAX_PENDING);
        assert_eq!(queries.num_waiting(), 3);
    }

    #[tokio::test]
    async fn expiry_frees_slots_and_promotes() {
        let socket = Socket::bind(0).await.unwrap();
        let mut queries = PendingQueries::new();
        let dest = test::dummy_socket_addr_v4();

        for index in 0..MAX_PENDING + 2 {
            queries
                .send(
                    &socket,
                    ping_request(),
                    dest,
                    QueryLink::Populate(index as u64),
                )
                .await;
        }

        // Nothing expires before the budget runs out.
        for _ in 0..TICK_BUDGET - 1 {
            assert!(queries.tick(&socket).await.is_empty());
        }

        // The first twenty expire together; the two parked queries move up.
        let expired = queries.tick(&socket).await;
        assert_eq!(expired.len(), MAX_PENDING);
        assert_eq!(queries.num_pending(), 2);
        assert_eq!(queries.num_waiting(), 0);
    }

    #[tokio::test]
    async fn claim_requires_matching_source() {
        let socket = Socket::bind(0).await.unwrap();
        let mut queries = PendingQueries::new();
        let dest = test::dummy_socket_addr_v4();

        queries
            .send(&socket, ping_request(), dest, QueryLink::Ping)
            .await;
        let tid = *queries.pending.keys().next().unwrap();

        let stranger = SocketAddrV4::new([127, 0, 0, 9].into(), 1234);
        assert_eq!(queries.claim(tid, stranger), None);
        assert_eq!(queries.claim(tid, dest), Some(QueryLink::Ping));
        // Second claim finds nothing - duplicate responses are ignored.
        assert_eq!(queries.claim(tid, dest), None);
    }

    #[tokio::test]
    async fn tid_allocation_skips_in_flight_ids() {
        let socket = Socket::bind(0).await.unwrap();
        let mut queries = PendingQueries::new();
        let dest = test::dummy_socket_addr_v4();

        queries.next_tid = u16::MAX;
        queries
            .send(&socket, ping_request(), dest, QueryLink::Ping)
            .await;
        assert!(queries.pending.contains_key(&u16::MAX));

        // Force a wrap-around collision.
        queries.next_tid = u16::MAX;
        queries
            .send(&socket, ping_request(), dest, QueryLink::Ping)
            .await;

        assert_eq!(queries.num_pending(), 2);
        assert!(queries.pending.contains_key(&0));
    }

    #[test]
    fn tid_parsing() {
        assert_eq!(parse_tid(b""), None);
        assert_eq!(parse_tid(b"\x07"), Some(7));
        assert_eq!(parse_tid(b"\x01\x02"), Some(258));
        assert_eq!(parse_tid(b"abc"), None);
    }
}
