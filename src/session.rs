//! Live session for forwarding non-video envelopes
//!
//! Envelopes that are not decoded are handed unchanged to a [`LiveSession`]
//! so that consumers listening to the session see the rest of the recorded
//! timeline. [`Od4Session`] sends each envelope as one framed UDP datagram to
//! the multicast group of the session id (`225.0.0.<cid>:12175`).

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use tracing::{debug, info, trace};

use crate::envelope::{Envelope, TimeStamp};
use crate::recording::format::frame_envelope;
use crate::{ReplayError, Result};

/// UDP port shared by all sessions
pub const SESSION_PORT: u16 = 12175;

/// Outbound session consumed by the pacing loop
pub trait LiveSession: Send {
    /// Whether the session still accepts envelopes.
    fn is_running(&self) -> bool;

    /// Forward one envelope. Delivery is fire-and-forget.
    fn send(&mut self, envelope: Envelope) -> Result<()>;
}

/// Multicast group address for a session id.
pub fn session_group(cid: u16) -> Result<Ipv4Addr> {
    let last = u8::try_from(cid).map_err(|_| {
        ReplayError::config(format!("session id {} is outside the valid range 1-254", cid))
    })?;
    if last == 0 || last == 255 {
        return Err(ReplayError::config(format!(
            "session id {} is outside the valid range 1-254",
            cid
        )));
    }
    Ok(Ipv4Addr::new(225, 0, 0, last))
}

/// UDP multicast session
pub struct Od4Session {
    cid: u16,
    socket: UdpSocket,
    destination: SocketAddrV4,
    running: bool,
    sent: u64,
}

impl Od4Session {
    /// Open a sending socket for session `cid`.
    pub fn open(cid: u16) -> Result<Self> {
        let group = session_group(cid)?;
        let socket = Self::create_socket()
            .map_err(|e| ReplayError::session(format!("failed to open session {}", cid), Some(e)))?;
        let destination = SocketAddrV4::new(group, SESSION_PORT);

        info!(cid, %destination, "Opened live session");
        Ok(Self { cid, socket, destination, running: true, sent: 0 })
    }

    fn create_socket() -> std::io::Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;

        Ok(socket.into())
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Number of envelopes forwarded so far
    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    /// Stop accepting envelopes; the pacing loop ends at its next check.
    pub fn stop(&mut self) {
        debug!(cid = self.cid, "Stopping live session");
        self.running = false;
    }
}

impl LiveSession for Od4Session {
    fn is_running(&self) -> bool {
        self.running
    }

    fn send(&mut self, mut envelope: Envelope) -> Result<()> {
        if !self.running {
            return Err(ReplayError::session("session is stopped", None));
        }

        envelope.sent = TimeStamp::now();
        let datagram = frame_envelope(&envelope.encode()?)?;
        self.socket.send_to(&datagram, self.destination).map_err(|e| {
            ReplayError::session(
                format!("failed to forward envelope of type {}", envelope.data_type),
                Some(e),
            )
        })?;

        self.sent += 1;
        trace!(
            data_type = envelope.data_type,
            sender = envelope.sender_stamp,
            bytes = datagram.len(),
            "Forwarded envelope"
        );
        Ok(())
    }
}
