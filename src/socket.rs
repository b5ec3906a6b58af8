//! Helpers to simplify work with the UDPv4 socket.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};
use tokio::net::UdpSocket;

/// Large enough for any datagram we are willing to process.
const MAX_DATAGRAM_SIZE: usize = 1500;

/// Datagrams from one source beyond this count per housekeeping window are
/// dropped.
const SPAM_THRESHOLD: u32 = 10;

pub(crate) struct Socket {
    inner: UdpSocket,
}

impl Socket {
    /// Bind to the given local UDPv4 port.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let inner = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        Ok(Self { inner })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.inner.local_addr()?.port())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        match self.inner.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "socket not bound to an ipv4 address",
            )),
        }
    }

    pub async fn send(&self, bytes: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        let mut bytes_sent = 0;

        while bytes_sent < bytes.len() {
            let num_sent = self
                .inner
                .send_to(&bytes[bytes_sent..], SocketAddr::V4(addr))
                .await?;
            bytes_sent += num_sent;
        }

        Ok(())
    }

    /// Receive the next datagram from an IPv4 sender. Non-IPv4 senders are
    /// dropped without surfacing.
    ///
    /// This function is cancel safe: https://docs.rs/tokio/1.12.0/tokio/net/struct.UdpSocket.html#cancel-safety-6
    pub async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddrV4)> {
        loop {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            let (size, addr) = self.inner.recv_from(&mut buffer).await?;

            if let SocketAddr::V4(addr) = addr {
                buffer.truncate(size);
                return Ok((buffer, addr));
            }
        }
    }
}

// ----------------------------------------------------------------------------//

/// What the shield decided about a datagram's source.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum SpamVerdict {
    /// Process the datagram.
    Allow,
    /// The source just crossed the threshold - report it, then discard.
    JustBlocked,
    /// Known spammer, discard silently.
    Blocked,
}

/// Per-source datagram counter. The counters are wiped wholesale at each
/// housekeeping tick, so a "window" is one housekeeping interval.
pub(crate) struct SpamShield {
    counters: HashMap<SocketAddrV4, u32>,
}

impl SpamShield {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    pub fn check(&mut self, source: SocketAddrV4) -> SpamVerdict {
        let count = self.counters.entry(source).or_insert(0);
        *count += 1;

        if *count < SPAM_THRESHOLD {
            SpamVerdict::Allow
        } else if *count == SPAM_THRESHOLD {
            SpamVerdict::JustBlocked
        } else {
            SpamVerdict::Blocked
        }
    }

    pub fn clear(&mut self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn shield_reports_once_then_discards() {
        let mut shield = SpamShield::new();
        let source = test::dummy_socket_addr_v4();

        for _ in 0..SPAM_THRESHOLD - 1 {
            assert_eq!(shield.check(source), SpamVerdict::Allow);
        }

        assert_eq!(shield.check(source), SpamVerdict::JustBlocked);
        assert_eq!(shield.check(source), SpamVerdict::Blocked);
        assert_eq!(shield.check(source), SpamVerdict::Blocked);
    }

    #[test]
    fn shield_counts_per_source() {
        let mut shield = SpamShield::new();
        let noisy = test::dummy_socket_addr_v4();
        let quiet = SocketAddrV4::new([127, 0, 0, 2].into(), 6881);

        for _ in 0..SPAM_THRESHOLD {
            shield.check(noisy);
        }

        assert_eq!(shield.check(noisy), SpamVerdict::Blocked);
        assert_eq!(shield.check(quiet), SpamVerdict::Allow);
    }

    #[test]
    fn clear_resets_the_window() {
        let mut shield = SpamShield::new();
        let source = test::dummy_socket_addr_v4();

        for _ in 0..SPAM_THRESHOLD {
            shield.check(source);
        }
        assert_eq!(shield.check(source), SpamVerdict::Blocked);

        shield.clear();

        assert_eq!(shield.check(source), SpamVerdict::Allow);
    }
}
