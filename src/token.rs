//! Announce/put tokens.
//!
//! A token proves that whoever wants to store something with us was recently
//! reachable at the address it claims: we hand it out in `get_peers`/`get`
//! responses and require it back in `announce_peer`/`put`. Tokens are not
//! remembered individually - they are `SHA-1(node ∥ secret)` over the sender's
//! 26-byte id-plus-location form, and we only keep the secret. The secret
//! rotates on the housekeeping tick; tokens minted under the previous secret
//! stay valid for one more window.

use crate::contact::ContactInfo;
use sha1::{Digest, Sha1};

const SECRET_LEN: usize = 20;

pub(crate) struct TokenStore {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

impl TokenStore {
    pub fn new() -> Self {
        // The previous secret starts out random as well, otherwise a fresh
        // node would accept guessable tokens for its first window.
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    /// Mint a token for the given sender.
    pub fn checkout(&self, sender: &ContactInfo) -> [u8; SECRET_LEN] {
        mint(sender, &self.current)
    }

    /// Validate a token from the given sender. Accepts tokens minted under
    /// the current or the previous secret.
    pub fn checkin(&self, sender: &ContactInfo, token: &[u8]) -> bool {
        token == mint(sender, &self.current) || token == mint(sender, &self.previous)
    }

    /// Retire the current secret. Called every housekeeping tick.
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

fn mint(sender: &ContactInfo, secret: &[u8; SECRET_LEN]) -> [u8; SECRET_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(sender.packed());
    hasher.update(secret);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{id::InfoHash, test};

    fn dummy_sender() -> ContactInfo {
        ContactInfo::new(InfoHash::sha1(b"sender"), test::dummy_socket_addr_v4())
    }

    #[test]
    fn accepts_fresh_token() {
        let store = TokenStore::new();
        let sender = dummy_sender();

        let token = store.checkout(&sender);

        assert!(store.checkin(&sender, &token));
    }

    #[test]
    fn accepts_token_from_previous_window() {
        let mut store = TokenStore::new();
        let sender = dummy_sender();

        let token = store.checkout(&sender);
        store.rotate();

        assert!(store.checkin(&sender, &token));
    }

    #[test]
    fn rejects_token_older_than_two_windows() {
        let mut store = TokenStore::new();
        let sender = dummy_sender();

        let token = store.checkout(&sender);
        store.rotate();
        store.rotate();

        assert!(!store.checkin(&sender, &token));
    }

    #[test]
    fn rejects_token_of_other_sender() {
        let store = TokenStore::new();
        let sender = dummy_sender();
        let other = ContactInfo::new(InfoHash::sha1(b"other"), test::dummy_socket_addr_v4());

        let token = store.checkout(&sender);

        assert!(!store.checkin(&other, &token));
    }

    #[test]
    fn rejects_garbage() {
        let store = TokenStore::new();
        let sender = dummy_sender();

        assert!(!store.checkin(&sender, b""));
        assert!(!store.checkin(&sender, b"aoeusnth"));
    }
}
