//! Per-gateway connection state.
//!
//! A `Gateway` exists only while the server considers the peer connected.
//! All mutation happens on the server task; the struct itself carries no
//! synchronization.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::seal::SensorSealUpdate;
use crate::protocol::{GatewayUid, Key};

/// Maximum entries kept in the sent-message retransmission queue.
pub const SENT_MSG_LIST_MAX_LEN: usize = 100;

/// Maximum received packet IDs remembered for duplicate suppression.
pub const RECEIVED_ID_FIFO_MAX_LEN: usize = 100;

/// Fixed retransmission timeout.
pub const RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(2000);

/// An outbound MSGCONF awaiting its RCPTOK.
///
/// `bytes` is the packed datagram; retransmissions resend it verbatim, so
/// the original IV is reused with the identical ciphertext.
#[derive(Debug)]
pub struct SentMessage {
    pub packet_id: u16,
    pub last_sent: Instant,
    pub bytes: Vec<u8>,
}

/// Application hook receiving decoded telemetry for one gateway.
pub type MessageHook = Box<dyn FnMut(&SensorSealUpdate) + Send>;

/// Application hook fired after an observed gateway restart.
pub type ReconnectHook = Box<dyn FnMut() + Send>;

/// Connection state for one authorized gateway.
pub struct Gateway {
    pub uid: GatewayUid,
    pub(crate) key: Key,
    /// Peer endpoint from the most recent CONN; all sends go here.
    pub remote_addr: SocketAddr,
    /// Instant of the most recent valid inbound packet.
    pub last_seen: Instant,
    send_packet_id: u16,
    pub(crate) sent_messages: VecDeque<SentMessage>,
    received_ids: VecDeque<u16>,
    /// When set, fire `on_reconnect` once this instant passes.
    pub(crate) reconnect_due: Option<Instant>,
    pub(crate) on_message: Option<MessageHook>,
    pub(crate) on_reconnect: Option<ReconnectHook>,
}

impl Gateway {
    pub(crate) fn new(uid: GatewayUid, key: Key, remote_addr: SocketAddr, now: Instant) -> Self {
        Gateway {
            uid,
            key,
            remote_addr,
            last_seen: now,
            send_packet_id: 0,
            sent_messages: VecDeque::new(),
            received_ids: VecDeque::new(),
            reconnect_due: None,
            on_message: None,
            on_reconnect: None,
        }
    }

    /// Install the telemetry delivery hook.
    pub fn on_message(&mut self, hook: impl FnMut(&SensorSealUpdate) + Send + 'static) {
        self.on_message = Some(Box::new(hook));
    }

    /// Install the reconnect notification hook.
    pub fn on_reconnect(&mut self, hook: impl FnMut() + Send + 'static) {
        self.on_reconnect = Some(Box::new(hook));
    }

    /// The packet ID the next outbound MSGCONF will carry.
    pub fn send_packet_id(&self) -> u16 {
        self.send_packet_id
    }

    pub(crate) fn advance_send_id(&mut self) {
        self.send_packet_id = self.send_packet_id.wrapping_add(1);
    }

    /// Queue a transmitted datagram for retransmission, evicting the
    /// oldest entry past the queue bound.
    pub(crate) fn enqueue_sent(&mut self, packet_id: u16, bytes: Vec<u8>, now: Instant) {
        self.sent_messages.push_back(SentMessage {
            packet_id,
            last_sent: now,
            bytes,
        });
        if self.sent_messages.len() > SENT_MSG_LIST_MAX_LEN {
            self.sent_messages.pop_front();
        }
    }

    /// Drop the queued message acknowledged by `packet_id`. Returns false
    /// when no queued message matches.
    pub(crate) fn ack(&mut self, packet_id: u16) -> bool {
        match self
            .sent_messages
            .iter()
            .position(|m| m.packet_id == packet_id)
        {
            Some(index) => {
                self.sent_messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Record an inbound MSGSTATUS packet ID. Returns false for a
    /// duplicate still present in the FIFO (re-ack, do not re-deliver).
    pub(crate) fn record_received(&mut self, packet_id: u16) -> bool {
        if self.received_ids.contains(&packet_id) {
            return false;
        }
        self.received_ids.push_back(packet_id);
        if self.received_ids.len() > RECEIVED_ID_FIFO_MAX_LEN {
            self.received_ids.pop_front();
        }
        true
    }

    /// Reset sequencing state after a peer restart: fresh packet IDs,
    /// empty queues, new endpoint, reconnect notification scheduled one
    /// retransmission timeout out.
    pub(crate) fn reset(&mut self, remote_addr: SocketAddr, now: Instant) {
        self.remote_addr = remote_addr;
        self.send_packet_id = 0;
        self.sent_messages.clear();
        self.received_ids.clear();
        self.reconnect_due = Some(now + RETRANSMISSION_TIMEOUT);
    }
}
