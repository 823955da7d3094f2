//! Gateway server core — UDP dispatch, reliability driver, periodic tick.
//!
//! The server runs as a single task looping over three event sources: the
//! UDP socket, a 200 ms housekeeping tick, and an application command
//! channel. Every piece of per-gateway state is mutated from that one
//! task, so the dispatch path needs no locking and observes datagrams in
//! UDP delivery order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::config::GatewayTable;
use crate::protocol::codec::{self, Packet, ParseOutcome};
use crate::protocol::seal::UpdateParser;
use crate::protocol::{GatewayUid, Key, PacketType};

pub mod gateway;

pub use gateway::Gateway;
use gateway::RETRANSMISSION_TIMEOUT;

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 1818;

/// Cadence of the retransmission / housekeeping tick.
const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Retransmissions allowed per gateway per tick.
const MAX_RETRANSMITS_PER_TICK: usize = 10;

/// CONNFAIL is packed under the all-zero key so an unauthenticated peer
/// can still recognize the rejection.
const ZERO_KEY: Key = [0u8; 32];

/// Commands accepted from application handles.
enum Command {
    Send { uid: GatewayUid, payload: Vec<u8> },
    Shutdown,
}

/// Cloneable application-side handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ServerHandle {
    /// Dispatch a configuration payload (≤ 255 bytes) to a connected
    /// gateway as a reliable MSGCONF. Executed on the server task.
    pub fn send(&self, uid: GatewayUid, payload: Vec<u8>) {
        if self.cmd_tx.send(Command::Send { uid, payload }).is_err() {
            tracing::error!("server command channel closed, send dropped");
        }
    }

    /// Stop the server loop after in-flight work completes.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// Hook invoked for each newly connected gateway; installs the per-gateway
/// `on_message` / `on_reconnect` hooks.
pub type ConnectionHook = Box<dyn FnMut(&mut Gateway) + Send>;

/// Running totals, kept by the server task.
#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    pub datagrams_received: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub retransmitted: u64,
    pub connections: u64,
    pub connfails_sent: u64,
}

/// The SSGS server: socket, authorization table and connected-gateway set.
pub struct Server {
    socket: UdpSocket,
    table: GatewayTable,
    gateways: HashMap<GatewayUid, Gateway>,
    on_connection: ConnectionHook,
    parser: Box<dyn UpdateParser>,
    idle_timeout: Option<Duration>,
    stats: ServerStats,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl Server {
    /// Bind the UDP socket and assemble a server around the given
    /// authorization table, connection hook and payload parser.
    pub async fn bind(
        port: u16,
        table: GatewayTable,
        on_connection: ConnectionHook,
        parser: Box<dyn UpdateParser>,
    ) -> Result<Self> {
        let bind_addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", bind_addr))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Server {
            socket,
            table,
            gateways: HashMap::new(),
            on_connection,
            parser,
            idle_timeout: None,
            stats: ServerStats::default(),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
        })
    }

    /// Handle for application-side sends and shutdown.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Evict gateways idle longer than `timeout` during the tick. Off by
    /// default; eviction is not part of observable protocol behavior.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("local_addr")
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Run the server loop until a shutdown command arrives.
    pub async fn run(mut self) -> Result<()> {
        let mut cmd_rx = self.cmd_rx.take().context("server already running")?;
        let mut tick = time::interval(TICK_INTERVAL);
        let mut buf = [0u8; codec::MAX_DATAGRAM_LEN];

        tracing::info!("SSGS listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, from)) => self.dispatch(&buf[..len], from).await,
                    Err(e) => {
                        tracing::warn!("UDP recv error: {:#}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = tick.tick() => self.tick().await,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { uid, payload }) => self.send(uid, &payload).await,
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        let stats = &self.stats;
        tracing::info!(
            "SSGS stopped. Received: {} ({} dropped), delivered: {}, retransmitted: {}",
            stats.datagrams_received,
            stats.dropped,
            stats.delivered,
            stats.retransmitted
        );
        Ok(())
    }

    /// Process one inbound datagram.
    async fn dispatch(&mut self, datagram: &[u8], from: SocketAddr) {
        self.stats.datagrams_received += 1;

        let Some(uid) = codec::parse_uid(datagram) else {
            tracing::debug!("malformed datagram from {}, dropping", from);
            self.stats.dropped += 1;
            return;
        };

        let Some(key) = self.table.key_for(&uid).copied() else {
            tracing::debug!("unauthorized gateway {} from {}, dropping", uid, from);
            self.stats.dropped += 1;
            return;
        };

        match codec::parse(datagram, &key) {
            ParseOutcome::Malformed => {
                tracing::debug!("malformed datagram from gateway {}, dropping", uid);
                self.stats.dropped += 1;
            }
            ParseOutcome::AuthFailed { uid } => {
                tracing::debug!("auth tag mismatch for gateway {}, rejecting", uid);
                send_control(&self.socket, PacketType::ConnFail, uid, 0, &ZERO_KEY, from).await;
                self.stats.connfails_sent += 1;
                self.stats.dropped += 1;
            }
            ParseOutcome::Ok(packet) => self.handle_packet(packet, &key, from).await,
        }
    }

    /// Dispatch an authenticated packet against the connected-gateway set.
    async fn handle_packet(&mut self, packet: Packet, key: &Key, from: SocketAddr) {
        let uid = packet.uid;
        let kind = PacketType::from_wire(packet.packet_type);
        let now = Instant::now();

        let Self {
            socket,
            gateways,
            on_connection,
            parser,
            stats,
            ..
        } = self;

        if !gateways.contains_key(&uid) {
            if kind == Some(PacketType::Conn) {
                send_control(socket, PacketType::ConnAcpt, uid, packet.packet_id, key, from).await;
                let mut gw = Gateway::new(uid, *key, from, now);
                (on_connection)(&mut gw);
                gateways.insert(uid, gw);
                stats.connections += 1;
                tracing::info!("gateway {} connected from {}", uid, from);
            } else {
                tracing::debug!(
                    "packet type {} from unconnected gateway {}, rejecting",
                    packet.packet_type,
                    uid
                );
                send_control(socket, PacketType::ConnFail, uid, packet.packet_id, &ZERO_KEY, from)
                    .await;
                stats.connfails_sent += 1;
            }
            return;
        }
        let Some(gw) = gateways.get_mut(&uid) else {
            return;
        };

        gw.last_seen = now;

        match kind {
            Some(PacketType::Conn) => {
                // Peer restart: fresh sequencing state, new endpoint, and a
                // reconnect notification once the old in-flight window has
                // certainly drained.
                gw.reset(from, now);
                send_control(socket, PacketType::ConnAcpt, uid, packet.packet_id, key, from).await;
                tracing::info!("gateway {} reconnected from {}", uid, from);
            }
            Some(PacketType::RcptOk) => {
                if !gw.ack(packet.packet_id) {
                    tracing::debug!(
                        "receipt for unknown packet {} from gateway {}",
                        packet.packet_id,
                        uid
                    );
                }
            }
            Some(PacketType::MsgStatus) => {
                if gw.record_received(packet.packet_id) {
                    send_control(
                        socket,
                        PacketType::RcptOk,
                        uid,
                        packet.packet_id,
                        key,
                        gw.remote_addr,
                    )
                    .await;
                    let update = parser.parse(&packet.payload);
                    stats.delivered += 1;
                    if let Some(hook) = gw.on_message.as_mut() {
                        hook(&update);
                    }
                } else {
                    // Duplicate: the earlier receipt was lost. Re-ack only.
                    send_control(
                        socket,
                        PacketType::RcptOk,
                        uid,
                        packet.packet_id,
                        key,
                        gw.remote_addr,
                    )
                    .await;
                    tracing::debug!(
                        "duplicate MSGSTATUS {} from gateway {}, re-acknowledged",
                        packet.packet_id,
                        uid
                    );
                }
            }
            Some(PacketType::MsgConf) | Some(PacketType::ConnAcpt) | Some(PacketType::ConnFail) => {
                tracing::debug!(
                    "server received outbound-only packet type {} from gateway {}, dropping",
                    packet.packet_type,
                    uid
                );
            }
            None => {
                debug_assert!(false, "unknown packet type {}", packet.packet_type);
                tracing::error!(
                    "protocol violation: unknown packet type {} from gateway {}",
                    packet.packet_type,
                    uid
                );
            }
        }
    }

    /// Build, transmit and queue a MSGCONF for `uid`.
    pub async fn send(&mut self, uid: GatewayUid, payload: &[u8]) {
        let Self {
            socket, gateways, ..
        } = self;

        let Some(gw) = gateways.get_mut(&uid) else {
            tracing::warn!("send to unconnected gateway {}, dropping", uid);
            return;
        };

        let packet_id = gw.send_packet_id();
        let packet = Packet::new(PacketType::MsgConf, uid, packet_id, payload.to_vec());
        let bytes = match codec::pack(&packet, &gw.key) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("packing MSGCONF for gateway {} failed: {}", uid, e);
                return;
            }
        };
        gw.advance_send_id();

        // A failed transmit is not fatal: the entry is queued regardless
        // and the tick retries it.
        if let Err(e) = socket.send_to(&bytes, gw.remote_addr).await {
            tracing::warn!("UDP send to {} failed: {:#}", gw.remote_addr, e);
        }
        gw.enqueue_sent(packet_id, bytes, Instant::now());
    }

    /// One housekeeping pass: due reconnect notifications, retransmission
    /// of unacknowledged messages, and (when enabled) idle eviction.
    async fn tick(&mut self) {
        let now = Instant::now();
        let Self {
            socket,
            gateways,
            stats,
            idle_timeout,
            ..
        } = self;

        for gw in gateways.values_mut() {
            if let Some(due) = gw.reconnect_due {
                if now >= due {
                    gw.reconnect_due = None;
                    if let Some(hook) = gw.on_reconnect.as_mut() {
                        hook();
                    }
                }
            }

            let mut resent = 0;
            for msg in gw.sent_messages.iter_mut() {
                if resent == MAX_RETRANSMITS_PER_TICK {
                    break;
                }
                if now.duration_since(msg.last_sent) > RETRANSMISSION_TIMEOUT {
                    // Resend the original bytes: identical ciphertext and
                    // IV, so the keystream is never reused with new data.
                    match socket.send_to(&msg.bytes, gw.remote_addr).await {
                        Ok(_) => {
                            msg.last_sent = now;
                            resent += 1;
                            stats.retransmitted += 1;
                        }
                        Err(e) => {
                            tracing::warn!(
                                "retransmit to {} failed, will retry: {:#}",
                                gw.remote_addr,
                                e
                            );
                        }
                    }
                }
            }
            if resent > 0 {
                tracing::debug!("retransmitted {} packet(s) to gateway {}", resent, gw.uid);
            }
        }

        if let Some(timeout) = *idle_timeout {
            gateways.retain(|uid, gw| {
                let keep = now.duration_since(gw.last_seen) <= timeout;
                if !keep {
                    tracing::info!("evicting idle gateway {}", uid);
                }
                keep
            });
        }
    }
}

/// Pack and transmit a control packet (empty payload). Send failures are
/// logged; control packets are unreliable by design.
async fn send_control(
    socket: &UdpSocket,
    kind: PacketType,
    uid: GatewayUid,
    packet_id: u16,
    key: &Key,
    to: SocketAddr,
) {
    let packet = Packet::new(kind, uid, packet_id, Vec::new());
    let bytes = match codec::pack(&packet, key) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("packing {:?} failed: {}", kind, e);
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, to).await {
        tracing::warn!("UDP send of {:?} to {} failed: {:#}", kind, to, e);
    }
}
