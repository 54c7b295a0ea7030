use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::control::{Command, ControlMessage};
use crate::protocol::midi::{MidiCommand, MidiCommandList, MidiMessage};
use crate::protocol::ProtocolError;
use crate::session::connection::{Disposition, MidiNetworkConnection};
use crate::session::{DatagramSender, SessionIdentity};
use crate::timestamp::Precision;

/// An AppleMIDI session that accepts invitations from remote participants
///  and broadcasts MIDI to every connection that completed negotiation.
///
/// The session listens on two UDP ports: `port` for session control and
///  `port + 1` for MIDI payload. Both receive loops run until [end](MidiNetworkSession::end)
///  is called.
pub struct MidiNetworkSession {
    shared: Arc<SessionShared>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct SessionShared {
    identity: SessionIdentity,
    sequence_number: AtomicU16,
    /// remote SSRC -> connection. The only state shared between the two
    ///  receive loops and the application's tasks.
    connections: RwLock<FxHashMap<u32, Arc<Mutex<MidiNetworkConnection>>>>,
    control_socket: Arc<UdpSocket>,
    midi_socket: Arc<UdpSocket>,
}

impl MidiNetworkSession {
    /// Start a new session. Binding either port is the only fatal error.
    pub async fn start(name: &str, port: u16) -> anyhow::Result<MidiNetworkSession> {
        let control_socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let midi_socket = Arc::new(UdpSocket::bind(("0.0.0.0", port + 1)).await?);

        let shared = Arc::new(SessionShared {
            identity: SessionIdentity {
                ssrc: rand::random(),
                name: name.to_string(),
                start_time: Instant::now(),
            },
            sequence_number: AtomicU16::new(rand::random()),
            connections: Default::default(),
            control_socket: control_socket.clone(),
            midi_socket: midi_socket.clone(),
        });
        info!(
            "session [{}] with SSRC [{:08x}] listening on control port {} and data port {}",
            name,
            shared.identity.ssrc,
            port,
            port + 1
        );

        let listener_tasks = vec![
            tokio::spawn(receive_loop(control_socket, shared.clone())),
            tokio::spawn(receive_loop(midi_socket, shared.clone())),
        ];

        Ok(MidiNetworkSession {
            shared,
            listener_tasks: Mutex::new(listener_tasks),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.shared.identity.ssrc
    }

    pub fn name(&self) -> &str {
        &self.shared.identity.name
    }

    /// Send a single MIDI payload immediately to all ready connections.
    pub async fn send_midi(&self, payload: &[u8]) -> Result<Precision, ProtocolError> {
        self.send_midi_commands(MidiCommandList {
            timestamp: Instant::now(),
            commands: vec![MidiCommand {
                delta_time: Duration::ZERO,
                payload: payload.to_vec(),
            }],
        })
        .await
    }

    /// Send a command list to all ready connections. The packet is encoded
    ///  once; per-connection send failures are logged and do not abort the
    ///  broadcast. Encode failures (e.g. an oversized list) are the caller's
    ///  to handle.
    pub async fn send_midi_commands(&self, commands: MidiCommandList) -> Result<Precision, ProtocolError> {
        let shared = &self.shared;
        let msg = MidiMessage {
            sequence_number: shared.sequence_number.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            ssrc: shared.identity.ssrc,
            commands,
        };

        let mut buf = BytesMut::new();
        let precision = msg.ser(&mut buf, shared.identity.start_time)?;
        if precision == Precision::Saturated {
            warn!("delta time overflow in {}, clamped to the 4-octet maximum", msg);
        }
        debug!("<- outgoing payload: {}", msg);

        // snapshot so connections removed mid-broadcast don't invalidate the
        //  iteration
        let connections: Vec<_> = shared.connections.read().await.values().cloned().collect();
        for conn in connections {
            conn.lock().await.send_midi(&buf, shared.midi_socket.as_ref()).await;
        }
        Ok(precision)
    }

    /// End the session: terminate every connection registered at this point,
    ///  then stop both receive loops. Idempotent; invitations arriving after
    ///  the registry is drained are not terminated.
    pub async fn end(&self) {
        let drained: Vec<_> = {
            let mut lock = self.shared.connections.write().await;
            lock.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.lock()
                .await
                .end(&self.shared.identity, self.shared.control_socket.as_ref())
                .await;
        }

        for task in self.listener_tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, shared: Arc<SessionShared>) {
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("error receiving datagram: {}", e);
                continue;
            }
        };

        // a malformed datagram must never take the loop down
        let msg = match ControlMessage::try_deser(&mut &buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("discarding malformed datagram ({} bytes) from {}: {}", len, from, e);
                continue;
            }
        };
        debug!("-> incoming message: {}", msg);

        shared.dispatch(msg, socket.as_ref(), from).await;
    }
}

impl SessionShared {
    async fn dispatch(&self, msg: ControlMessage, socket: &dyn DatagramSender, from: SocketAddr) {
        let Some(conn) = self.resolve_connection(&msg).await else {
            return;
        };

        let disposition = conn.lock().await.handle_control(&msg, &self.identity, socket, from).await;

        if disposition == Disposition::Detach {
            self.connections.write().await.remove(&msg.ssrc);
            info!("connection ended by remote participant SSRC [{:08x}]", msg.ssrc);
        }
    }

    /// Invitations create the connection lazily; everything else requires it
    ///  to exist already.
    async fn resolve_connection(&self, msg: &ControlMessage) -> Option<Arc<Mutex<MidiNetworkConnection>>> {
        if msg.cmd == Command::Invitation {
            if let Some(conn) = self.connections.read().await.get(&msg.ssrc) {
                return Some(conn.clone());
            }

            let mut lock = self.connections.write().await;
            // check again under the exclusive lock: the other receive loop
            //  may have won the race for this SSRC
            if let Some(conn) = lock.get(&msg.ssrc) {
                return Some(conn.clone());
            }
            info!("new connection requested by remote participant SSRC [{:08x}]", msg.ssrc);
            let conn = Arc::new(Mutex::new(MidiNetworkConnection::new(msg.ssrc, msg.name.clone())));
            lock.insert(msg.ssrc, conn.clone());
            Some(conn)
        } else {
            match self.connections.read().await.get(&msg.ssrc) {
                Some(conn) => Some(conn.clone()),
                None => {
                    debug!("connection to SSRC [{:08x}] not found", msg.ssrc);
                    None
                }
            }
        }
    }
}
