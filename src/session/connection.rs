use std::net::SocketAddr;

use bytes::BytesMut;
use tracing::{debug, error, warn};

use crate::protocol::control::{Command, ControlMessage};
use crate::session::{DatagramSender, SessionIdentity};
use crate::timestamp::MediaTimestamp;

/// Negotiation progress of a remote peer. The two invitations (control port
///  first, then data port) drive the two transitions; there is no terminal
///  state - a connection that ends is removed from the registry.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Initial,
    ControlEstablished,
    Ready,
}

/// What the dispatch loop should do with a connection after a message was
///  handled.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Disposition {
    Keep,
    Detach,
}

/// One remote peer of a session. Created lazily on the first invitation from
///  an unknown SSRC, owned exclusively by the session's registry.
///
/// All mutation happens in [MidiNetworkConnection::handle_control], which the
///  registry calls with the connection's lock held - the transition logic
///  assumes serialized access.
pub struct MidiNetworkConnection {
    remote_ssrc: u32,
    remote_name: Option<String>,
    state: ConnectionState,
    /// where session control messages (IN, OK, NO, BY, CK) are sent
    control_addr: Option<SocketAddr>,
    /// where MIDI payload is sent
    midi_addr: Option<SocketAddr>,
    /// remote clock offset estimate in ticks, from the synchronization
    ///  handshake
    clock_offset: Option<i64>,
}

impl MidiNetworkConnection {
    pub fn new(remote_ssrc: u32, remote_name: Option<String>) -> MidiNetworkConnection {
        MidiNetworkConnection {
            remote_ssrc,
            remote_name,
            state: ConnectionState::Initial,
            control_addr: None,
            midi_addr: None,
            clock_offset: None,
        }
    }

    pub fn remote_ssrc(&self) -> u32 {
        self.remote_ssrc
    }

    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn clock_offset(&self) -> Option<i64> {
        self.clock_offset
    }

    /// Handle an inbound control message. Replies go out on the socket the
    ///  message arrived on, addressed to the datagram's source.
    pub async fn handle_control(
        &mut self,
        msg: &ControlMessage,
        identity: &SessionIdentity,
        socket: &dyn DatagramSender,
        from: SocketAddr,
    ) -> Disposition {
        match msg.cmd {
            Command::Invitation => {
                self.handle_invitation(msg, identity, socket, from).await;
                Disposition::Keep
            }
            Command::End => Disposition::Detach,
            Command::Synchronization => {
                self.handle_synchronization(msg, identity, socket, from).await;
                Disposition::Keep
            }
            _ => {
                debug!("ignoring {} from SSRC [{:08x}]", msg.cmd, self.remote_ssrc);
                Disposition::Keep
            }
        }
    }

    async fn handle_invitation(
        &mut self,
        msg: &ControlMessage,
        identity: &SessionIdentity,
        socket: &dyn DatagramSender,
        from: SocketAddr,
    ) {
        match self.state {
            ConnectionState::Initial => {
                self.control_addr = Some(from);
                self.send_control(
                    ControlMessage::invitation_accepted(msg.token, identity.ssrc, &identity.name),
                    socket,
                    from,
                )
                .await;
                self.state = ConnectionState::ControlEstablished;
            }
            ConnectionState::ControlEstablished => {
                self.midi_addr = Some(from);
                self.send_control(
                    ControlMessage::invitation_accepted(msg.token, identity.ssrc, &identity.name),
                    socket,
                    from,
                )
                .await;
                self.state = ConnectionState::Ready;
            }
            ConnectionState::Ready => {
                // both channels are established - a third one is not supported
                warn!("rejecting additional invitation from SSRC [{:08x}]", self.remote_ssrc);
                self.send_control(
                    ControlMessage::invitation_rejected(msg.token, identity.ssrc, &identity.name),
                    socket,
                    from,
                )
                .await;
            }
        }
    }

    /// The three-exchange clock synchronization: with 1 or 2 timestamps we
    ///  append our own reading and echo; the full set of 3 yields the offset
    ///  estimate `((ts3 + ts1) / 2) - ts2`.
    async fn handle_synchronization(
        &mut self,
        msg: &ControlMessage,
        identity: &SessionIdentity,
        socket: &dyn DatagramSender,
        from: SocketAddr,
    ) {
        if self.state != ConnectionState::Ready {
            debug!("ignoring synchronization from SSRC [{:08x}] before the connection is ready", self.remote_ssrc);
            return;
        }

        match msg.timestamps.len() {
            1 | 2 => {
                let mut timestamps = msg.timestamps.clone();
                timestamps.push(MediaTimestamp::now(identity.start_time).as_u64());
                self.send_control(ControlMessage::synchronization(identity.ssrc, timestamps), socket, from)
                    .await;
            }
            3 => {
                let offset = (msg.timestamps[2] as i64 + msg.timestamps[0] as i64) / 2 - msg.timestamps[1] as i64;
                self.clock_offset = Some(offset);
                debug!("clock offset estimate for SSRC [{:08x}]: {} ticks", self.remote_ssrc, offset);
            }
            _ => {}
        }
    }

    /// Locally initiated teardown: tell the peer, then let the caller drop
    ///  this connection.
    pub async fn end(&self, identity: &SessionIdentity, socket: &dyn DatagramSender) {
        if let Some(addr) = self.control_addr {
            self.send_control(ControlMessage::end(identity.ssrc), socket, addr).await;
        }
    }

    /// Send an already encoded MIDI packet over the data channel. A no-op
    ///  until the connection is ready.
    pub async fn send_midi(&self, packet: &[u8], socket: &dyn DatagramSender) {
        if self.state != ConnectionState::Ready {
            return;
        }
        let Some(addr) = self.midi_addr else {
            return;
        };
        if let Err(e) = socket.send_datagram(addr, packet).await {
            warn!("failed to send MIDI packet to SSRC [{:08x}] at {}: {}", self.remote_ssrc, addr, e);
        }
    }

    async fn send_control(&self, msg: ControlMessage, socket: &dyn DatagramSender, to: SocketAddr) {
        let mut buf = BytesMut::new();
        if let Err(e) = msg.ser(&mut buf) {
            error!("cannot encode {}: {}", msg, e);
            return;
        }
        if let Err(e) = socket.send_datagram(to, &buf).await {
            warn!("failed to send {} to {}: {}", msg, to, e);
            return;
        }
        debug!("<- outgoing message: {}", msg);
    }

    #[cfg(test)]
    pub fn ready_for_test(remote_ssrc: u32, control_addr: SocketAddr, midi_addr: SocketAddr) -> MidiNetworkConnection {
        MidiNetworkConnection {
            remote_ssrc,
            remote_name: None,
            state: ConnectionState::Ready,
            control_addr: Some(control_addr),
            midi_addr: Some(midi_addr),
            clock_offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TrackingDatagramSender;
    use std::time::Instant;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            ssrc: 0x11223344,
            name: "Studio".to_string(),
            start_time: Instant::now(),
        }
    }

    fn invitation(token: u32) -> ControlMessage {
        ControlMessage {
            cmd: Command::Invitation,
            token,
            ssrc: 0xaabbccdd,
            name: Some("peer".to_string()),
            timestamps: vec![],
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    async fn ready_connection(sender: &TrackingDatagramSender, identity: &SessionIdentity) -> MidiNetworkConnection {
        let mut conn = MidiNetworkConnection::new(0xaabbccdd, Some("peer".to_string()));
        conn.handle_control(&invitation(1), identity, sender, addr(5004)).await;
        conn.handle_control(&invitation(2), identity, sender, addr(5005)).await;
        sender.next_control_sent().await;
        sender.next_control_sent().await;
        conn
    }

    #[tokio::test]
    async fn test_invitations_establish_control_then_midi() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let mut conn = MidiNetworkConnection::new(0xaabbccdd, Some("peer".to_string()));

        let disposition = conn.handle_control(&invitation(42), &identity, &sender, addr(5004)).await;
        assert_eq!(disposition, Disposition::Keep);
        assert_eq!(conn.state(), ConnectionState::ControlEstablished);
        sender
            .assert_control_sent(addr(5004), &ControlMessage::invitation_accepted(42, 0x11223344, "Studio"))
            .await;

        conn.handle_control(&invitation(43), &identity, &sender, addr(5005)).await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        sender
            .assert_control_sent(addr(5005), &ControlMessage::invitation_accepted(43, 0x11223344, "Studio"))
            .await;
        sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_third_invitation_is_rejected() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let mut conn = ready_connection(&sender, &identity).await;

        conn.handle_control(&invitation(44), &identity, &sender, addr(5004)).await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        sender
            .assert_control_sent(addr(5004), &ControlMessage::invitation_rejected(44, 0x11223344, "Studio"))
            .await;
    }

    #[tokio::test]
    async fn test_end_detaches_in_any_state() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let end = ControlMessage::end(0xaabbccdd);

        let mut conn = MidiNetworkConnection::new(0xaabbccdd, None);
        assert_eq!(conn.handle_control(&end, &identity, &sender, addr(5004)).await, Disposition::Detach);

        let mut conn = ready_connection(&sender, &identity).await;
        assert_eq!(conn.handle_control(&end, &identity, &sender, addr(5004)).await, Disposition::Detach);
        sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_synchronization_echoes_with_appended_timestamp() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let mut conn = ready_connection(&sender, &identity).await;

        let ck = ControlMessage::synchronization(0xaabbccdd, vec![10]);
        conn.handle_control(&ck, &identity, &sender, addr(5004)).await;

        let (to, reply) = sender.next_control_sent().await;
        assert_eq!(to, addr(5004));
        assert_eq!(reply.cmd, Command::Synchronization);
        assert_eq!(reply.ssrc, 0x11223344);
        assert_eq!(reply.timestamps.len(), 2);
        assert_eq!(reply.timestamps[0], 10);
    }

    #[tokio::test]
    async fn test_synchronization_completes_with_offset_estimate() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let mut conn = ready_connection(&sender, &identity).await;

        let ck = ControlMessage::synchronization(0xaabbccdd, vec![10, 12, 16]);
        conn.handle_control(&ck, &identity, &sender, addr(5004)).await;

        assert_eq!(conn.clock_offset(), Some(1));
        sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_synchronization_ignored_before_ready() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let mut conn = MidiNetworkConnection::new(0xaabbccdd, None);

        let ck = ControlMessage::synchronization(0xaabbccdd, vec![10]);
        conn.handle_control(&ck, &identity, &sender, addr(5004)).await;

        assert_eq!(conn.clock_offset(), None);
        sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_end_notifies_peer_on_control_channel() {
        let identity = identity();
        let sender = TrackingDatagramSender::new();
        let conn = ready_connection(&sender, &identity).await;

        conn.end(&identity, &sender).await;
        sender.assert_control_sent(addr(5004), &ControlMessage::end(0x11223344)).await;
    }

    #[tokio::test]
    async fn test_send_midi_only_when_ready() {
        let sender = TrackingDatagramSender::new();

        let conn = MidiNetworkConnection::new(0xaabbccdd, None);
        conn.send_midi(&[0x80, 0xe1], &sender).await;
        sender.assert_no_remaining_messages().await;

        let conn = MidiNetworkConnection::ready_for_test(0xaabbccdd, addr(5004), addr(5005));
        conn.send_midi(&[0x80, 0xe1], &sender).await;
        let (to, raw) = sender.next_sent().await;
        assert_eq!(to, addr(5005));
        assert_eq!(raw, vec![0x80, 0xe1]);
    }
}
