use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::protocol::control::ControlMessage;
use crate::session::DatagramSender;

/// A [DatagramSender] that records outgoing datagrams instead of sending
///  them.
#[derive(Default)]
pub struct TrackingDatagramSender {
    sent: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
}

impl TrackingDatagramSender {
    pub fn new() -> TrackingDatagramSender {
        Default::default()
    }

    /// Remove and return the oldest recorded datagram, unparsed.
    pub async fn next_sent(&self) -> (SocketAddr, Vec<u8>) {
        let mut lock = self.sent.write().await;
        if lock.is_empty() {
            panic!("no message was sent");
        }
        lock.remove(0)
    }

    /// Remove and return the oldest recorded datagram, decoded as a control
    ///  message.
    pub async fn next_control_sent(&self) -> (SocketAddr, ControlMessage) {
        let (to, raw) = self.next_sent().await;
        let msg = ControlMessage::try_deser(&mut raw.as_slice())
            .expect("recorded datagram is not a control message");
        (to, msg)
    }

    pub async fn assert_control_sent(&self, to: SocketAddr, expected: &ControlMessage) {
        let (actual_to, actual) = self.next_control_sent().await;
        assert_eq!(actual_to, to);
        assert_eq!(&actual, expected);
    }

    pub async fn assert_no_remaining_messages(&self) {
        assert!(self.sent.read().await.is_empty());
    }
}

#[async_trait]
impl DatagramSender for TrackingDatagramSender {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.write().await.push((to, buf.to_vec()));
        Ok(())
    }
}
