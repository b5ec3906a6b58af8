use crate::{
    contact::Contact,
    id::{NodeId, ID_BITS},
};
use std::mem;

/// Maximum number of contacts that should reside in any bucket.
pub(crate) const MAX_BUCKET_SIZE: usize = 8;

/// Fraction of surviving contacts that get a liveness ping on each refresh.
const REFRESH_FRACTION: usize = 10;

/// Fixed-capacity bucket of contacts.
#[derive(Clone, Default)]
pub(crate) struct Bucket {
    contacts: Vec<Contact>,
}

impl Bucket {
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    fn position(&self, id: NodeId) -> Option<usize> {
        self.contacts.iter().position(|contact| contact.id() == id)
    }
}

/// One level of the split tree. `far` holds contacts whose id differs from the
/// local id at this level's bit, `near` those whose bit matches. Only the last
/// (tip) level may have a populated `near` bucket - everything nearer lives in
/// deeper levels, which exist only once the tip overflows.
#[derive(Clone, Default)]
pub(crate) struct BucketPair {
    pub far: Bucket,
    pub near: Bucket,
}

/// XOR-bucketed table of the contacts this node routes through.
pub(crate) struct RoutingTable {
    pairs: Vec<BucketPair>,
    local_id: NodeId,
    // Temporary tables are query-planning scratchpads, not routing state.
    // They may contain their own id.
    temporary: bool,
}

/// What a refresh round decided: contacts that failed the previous round's
/// ping and were dropped, and contacts that should be pinged now.
pub(crate) struct RefreshOutcome {
    pub dropped: Vec<Contact>,
    pub ping: Vec<Contact>,
}

impl RoutingTable {
    /// Create a new RoutingTable with the given node id as our id.
    pub fn new(local_id: NodeId) -> Self {
        Self {
            pairs: vec![BucketPair::default()],
            local_id,
            temporary: false,
        }
    }

    /// Return the node id of the RoutingTable.
    pub fn node_id(&self) -> NodeId {
        self.local_id
    }

    fn tip_index(&self) -> usize {
        self.pairs.len() - 1
    }

    /// Locate the bucket that would hold `id`: the pair index, whether it is
    /// the near bucket, and the position within the bucket if the contact is
    /// currently there.
    pub fn find(&self, id: NodeId) -> (usize, bool, Option<usize>) {
        let differ = self.local_id.shared_prefix_bits(&id);
        let pair = differ.min(self.tip_index());
        let near = differ > pair;

        let bucket = if near {
            &self.pairs[pair].near
        } else {
            &self.pairs[pair].far
        };

        (pair, near, bucket.position(id))
    }

    /// Whether `id` belongs to the deepest (tip) pair.
    pub fn in_tip(&self, id: NodeId) -> bool {
        self.find(id).0 == self.tip_index()
    }

    /// Add the contact to the table if there is space for it.
    ///
    /// A contact that is already present is replaced, which refreshes its
    /// `last_seen`. Overflowing a far bucket discards the contact (near
    /// contacts are the valuable ones), overflowing the tip's near bucket
    /// splits the tree one level deeper.
    pub fn add(&mut self, contact: Contact) {
        if !self.temporary && contact.id() == self.local_id {
            return;
        }

        self.insert(contact);
    }

    fn insert(&mut self, contact: Contact) {
        let (pair, near, position) = self.find(contact.id());
        let pairs_len = self.pairs.len();

        let bucket = if near {
            &mut self.pairs[pair].near
        } else {
            &mut self.pairs[pair].far
        };

        if let Some(index) = position {
            bucket.contacts[index] = contact;
            return;
        }

        if bucket.contacts.len() < MAX_BUCKET_SIZE {
            bucket.contacts.push(contact);
            return;
        }

        if !near || pairs_len == ID_BITS {
            return;
        }

        bucket.contacts.push(contact);
        self.split_tip();
    }

    /// Grow the tree by one level and redistribute the old tip's near
    /// contacts by the next bit.
    fn split_tip(&mut self) {
        let drained = mem::take(&mut self.pairs.last_mut().unwrap().near.contacts);
        self.pairs.push(BucketPair::default());

        for contact in drained {
            self.insert(contact);
        }
    }

    /// Up to [`MAX_BUCKET_SIZE`] contacts of the tip pair, sorted by XOR
    /// distance to the local id, closest first.
    pub fn closest(&self) -> Vec<Contact> {
        let tip = self.pairs.last().unwrap();

        let mut contacts: Vec<_> = tip.far.iter().chain(tip.near.iter()).copied().collect();
        contacts.sort_by_key(|contact| contact.id().distance_to(&self.local_id));
        contacts.truncate(MAX_BUCKET_SIZE);
        contacts
    }

    /// Every contact in the table.
    pub fn all(&self) -> Vec<Contact> {
        let mut contacts: Vec<_> = self
            .pairs
            .iter()
            .flat_map(|pair| pair.far.iter())
            .copied()
            .collect();
        contacts.extend(self.pairs.last().unwrap().near.iter());
        contacts
    }

    /// Build a scratch table keyed by `local_id`, seeded with every contact of
    /// this table. The source is left untouched.
    pub fn make_temporary(&self, local_id: NodeId) -> Self {
        let mut table = Self {
            pairs: vec![BucketPair::default()],
            local_id,
            temporary: true,
        };

        for contact in self.all() {
            table.insert(contact);
        }

        table
    }

    /// One maintenance round: drop the contacts that never answered the
    /// previous round's ping, mark the stalest tenth of the survivors for
    /// pinging, and recompact the tree when drops left the tip too empty for
    /// `closest()` to fill a bucket.
    pub fn refresh(&mut self) -> RefreshOutcome {
        let mut dropped = Vec::new();

        for pair in &mut self.pairs {
            for bucket in [&mut pair.far, &mut pair.near] {
                bucket.contacts.retain(|contact| {
                    if contact.last_seen == 0 {
                        dropped.push(*contact);
                        false
                    } else {
                        true
                    }
                });
            }
        }

        let mut survivors = self.all();
        survivors.sort_by_key(|contact| contact.last_seen);

        let count = if survivors.is_empty() {
            0
        } else {
            (survivors.len() + REFRESH_FRACTION - 1) / REFRESH_FRACTION
        };

        let mut ping = Vec::new();
        for contact in &survivors[..count] {
            let (pair, near, position) = self.find(contact.id());
            let bucket = if near {
                &mut self.pairs[pair].near
            } else {
                &mut self.pairs[pair].far
            };

            if let Some(index) = position {
                bucket.contacts[index].last_seen = 0;
                ping.push(bucket.contacts[index]);
            }
        }

        if self.all().len() > MAX_BUCKET_SIZE && self.closest().len() < MAX_BUCKET_SIZE {
            let mut rebuilt = self.make_temporary(self.local_id);
            rebuilt.temporary = self.temporary;
            *self = rebuilt;
        }

        RefreshOutcome { dropped, ping }
    }
}

// ----------------------------------------------------------------------------//
