//! One peer session.
//!
//! `Client::connect` runs the whole connection preamble: TCP dial, handshake
//! exchange with info-hash validation, and receipt of the peer's mandatory
//! initial bitfield. What comes back is a session ready for the piece loop,
//! with the peer considered choking until it says otherwise.
//!
//! Every phase that expects an answer from the peer runs under a [`Deadline`]
//! guard, so a stalled peer turns into a timeout error instead of a hung
//! worker, and no timeout outlives the phase that installed it.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::bitfield::Bitfield;
use crate::handshake::Handshake;
use crate::message::{self, Message, MESSAGE_BITFIELD};
use crate::peer::Peer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// Scoped socket deadline.
///
/// Arms read and write timeouts on the connection and clears them again when
/// dropped, so early returns and `?` cannot leave a stale timeout behind.
pub struct Deadline {
    conn: TcpStream,
}

impl Deadline {
    fn install(conn: &TcpStream, timeout: Duration) -> io::Result<Deadline> {
        // The clone shares the underlying socket, and with it the timeouts.
        let conn = conn.try_clone()?;
        conn.set_read_timeout(Some(timeout))?;
        conn.set_write_timeout(Some(timeout))?;
        Ok(Deadline { conn })
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        // A socket that cannot clear its timeouts is already dead; the next
        // read or write surfaces the error.
        let _ = self.conn.set_read_timeout(None);
        let _ = self.conn.set_write_timeout(None);
    }
}

/// An established connection to one remote peer.
pub struct Client {
    peer: Peer,
    conn: TcpStream,
    bitfield: Bitfield,
    choked: bool,
}

impl Client {
    /// Dial a peer and run the connection preamble.
    ///
    /// On return the handshake has been exchanged and validated and the
    /// peer's bitfield stored. Any failure closes the connection.
    pub fn connect(peer: &Peer, peer_id: [u8; 20], info_hash: [u8; 20]) -> Result<Client> {
        let addr = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("could not connect to peer {peer}"))?;

        let mut client = Client {
            peer: peer.clone(),
            conn,
            bitfield: Bitfield::default(),
            choked: true,
        };

        client.exchange_handshake(peer_id, info_hash)?;
        client.receive_bitfield()?;

        info!("Connected to peer {}", client.peer);
        Ok(client)
    }

    /// Send our handshake, read the peer's, and check it is for our torrent.
    fn exchange_handshake(&mut self, peer_id: [u8; 20], info_hash: [u8; 20]) -> Result<()> {
        let _deadline = self.deadline(HANDSHAKE_TIMEOUT)?;

        let handshake = Handshake::new(info_hash, peer_id);
        self.conn
            .write_all(&handshake.serialize())
            .with_context(|| format!("could not send handshake to peer {}", self.peer))?;

        let reply = Handshake::read(&mut self.conn)
            .with_context(|| format!("could not read handshake from peer {}", self.peer))?;

        if reply.info_hash != info_hash {
            bail!("peer {} answered for a different torrent", self.peer);
        }

        Ok(())
    }

    /// The first message after the handshake must be the peer's bitfield.
    fn receive_bitfield(&mut self) -> Result<()> {
        let _deadline = self.deadline(BITFIELD_TIMEOUT)?;

        match message::read(&mut self.conn)
            .with_context(|| format!("could not read bitfield from peer {}", self.peer))?
        {
            Some(message) if message.id == MESSAGE_BITFIELD => {
                self.bitfield = Bitfield::new(message.payload);
                Ok(())
            }
            Some(message) => bail!(
                "peer {} sent message id {} instead of its bitfield",
                self.peer,
                message.id
            ),
            None => bail!("peer {} sent a keep-alive instead of its bitfield", self.peer),
        }
    }

    /// Arm a deadline over the whole connection until the guard drops.
    pub fn deadline(&self, timeout: Duration) -> Result<Deadline> {
        Deadline::install(&self.conn, timeout)
            .with_context(|| format!("could not set a deadline on peer {}", self.peer))
    }

    /// Whether the peer is currently refusing to serve our requests.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Record a CHOKE from the peer.
    pub fn mark_choked(&mut self) {
        self.choked = true;
    }

    /// Record an UNCHOKE from the peer.
    pub fn mark_unchoked(&mut self) {
        self.choked = false;
    }

    /// Whether the peer advertises piece `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    /// Record a HAVE: the peer now advertises piece `index`.
    pub fn record_have(&mut self, index: u32) {
        self.bitfield.set(index);
    }

    /// Read the next message. `None` is a keep-alive.
    pub fn read(&mut self) -> Result<Option<Message>> {
        let message = message::read(&mut self.conn)
            .with_context(|| format!("could not read message from peer {}", self.peer))?;

        match &message {
            Some(message) => debug!("Receive message id {} from peer {}", message.id, self.peer),
            None => debug!("Receive keep-alive from peer {}", self.peer),
        }

        Ok(message)
    }

    #[allow(dead_code)]
    pub fn send_choke(&mut self) -> Result<()> {
        self.send(&Message::new(message::MESSAGE_CHOKE), "CHOKE")
    }

    pub fn send_unchoke(&mut self) -> Result<()> {
        self.send(&Message::new(message::MESSAGE_UNCHOKE), "UNCHOKE")
    }

    pub fn send_interested(&mut self) -> Result<()> {
        self.send(&Message::new(message::MESSAGE_INTERESTED), "INTERESTED")
    }

    #[allow(dead_code)]
    pub fn send_not_interested(&mut self) -> Result<()> {
        self.send(&Message::new(message::MESSAGE_NOT_INTERESTED), "NOT INTERESTED")
    }

    /// Advertise that we now have piece `index`.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        self.send(&Message::have(index), "HAVE")
    }

    /// Request `length` bytes of piece `index` starting at `begin`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        debug!(
            "Send REQUEST for piece {} [{}..{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.conn
            .write_all(&Message::request(index, begin, length).serialize())
            .map_err(|_| anyhow!("could not send REQUEST to peer {}", self.peer))
    }

    fn send(&mut self, message: &Message, what: &str) -> Result<()> {
        debug!("Send {} to peer {}", what, self.peer);
        self.conn
            .write_all(&message.serialize())
            .map_err(|_| anyhow!("could not send {} to peer {}", what, self.peer))
    }
}
