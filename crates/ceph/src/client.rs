//! The explicit client handle (§3.3, §4.10), replacing the source client's
//! process-global singleton: one `CephClient` owns one [`Messenger`] and one
//! [`SnapEngine`] for the lifetime of a process.

use std::net::SocketAddr;

use ceph_messenger::{EntityType, Identity, Messenger, MessengerEvent, PeerToken};
use ceph_snap::{CapSnap, EncodedRealm, Ino, SnapContext, SnapEngine, SnapFlushSink, SnapMessage, SnapOp};
use tracing::{debug, warn};

use crate::{
    config::ClientConfig,
    error::{ClientError, Result},
};

/// Owns the messenger and snap engine for one client process (§9's
/// "explicit handle returned from an `initialize` call", replacing a
/// process-wide mutable global).
pub struct CephClient {
    messenger: Messenger,
    snaps: SnapEngine,
    config: ClientConfig,
}

impl CephClient {
    /// Constructs a client from `config`, binding a listener if
    /// `config.listen_addr` is set (§4.10). Configuration is validated
    /// before any socket or realm state exists, so there is nothing to roll
    /// back on failure (§7).
    pub fn initialize(config: ClientConfig) -> Result<Self> {
        let (keepalive_interval, keepalive_timeout) = config.keepalive()?;
        let _backoff = config.backoff()?;

        let addr = config.listen_addr.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        let identity = Identity::new(EntityType::Client, config.client_num, addr);
        let mut messenger = Messenger::new(identity).map_err(ceph_messenger::ConnectionError::Io)?;

        if let Some(listen_addr) = config.listen_addr {
            messenger.bind(listen_addr).map_err(ceph_messenger::ConnectionError::Io)?;
        }

        debug!(%identity, keepalive_interval = %keepalive_interval, keepalive_timeout = %keepalive_timeout, "client initialized");

        Ok(Self { messenger, snaps: SnapEngine::new(), config })
    }

    /// Opens a session to the first configured monitor, per `config.mon_lossy` (§4.2).
    pub fn connect_mon(&mut self) -> Result<PeerToken> {
        let addr = *self.config.mon_addrs.first().ok_or(ClientError::NoMonitors)?;
        self.connect(addr, EntityType::Mon, 0, self.config.mon_lossy)
    }

    /// Opens a session to an arbitrary peer (§4.1, §4.2), applying this
    /// client's configured keepalive pair to the new connection.
    pub fn connect(&mut self, addr: SocketAddr, entity_type: EntityType, entity_num: u64, lossy: bool) -> Result<PeerToken> {
        let peer = Identity::new(entity_type, entity_num, addr);
        let token = self.messenger.connect(peer, lossy)?;
        let (interval, timeout) = self.config.keepalive()?;
        self.messenger.set_keepalive(token, interval.into(), timeout.into());
        self.messenger.set_backoff(token, self.config.backoff()?);
        Ok(token)
    }

    /// Sends a message to an already-open peer (§4.1).
    pub fn send(&mut self, peer: PeerToken, msg: ceph_messenger::Message) -> Result<()> {
        self.messenger.send(peer, msg)?;
        Ok(())
    }

    /// Drives the messenger's event loop once, including the keepalive
    /// check (§4.9). `timeout` bounds how long the underlying poll blocks
    /// when nothing is ready. Messages tagged `CEPH_MSG_CLIENT_SNAP` are
    /// intercepted and fed to the snap engine rather than handed back to the
    /// caller (§2: "incoming messages are dispatched by type, including
    /// snapshot updates that drive the snap engine").
    pub fn poll(&mut self, timeout: Option<std::time::Duration>) -> Result<Vec<MessengerEvent>> {
        let events = self.messenger.poll(timeout).map_err(ceph_messenger::ConnectionError::Io)?;
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            if let MessengerEvent::Message { msg, .. } = &event {
                if msg.header.msg_type == ceph_snap::CEPH_MSG_CLIENT_SNAP {
                    self.handle_snap_message(&msg.front);
                    continue;
                }
            }
            out.push(event);
        }
        Ok(out)
    }

    /// Decodes and applies one `CEPH_MSG_CLIENT_SNAP` body (§6, §4.6, §4.7).
    /// A corrupt message is dropped and logged rather than faulting the
    /// session (§7: "one bad message should not trigger a cascade").
    fn handle_snap_message(&self, front: &[u8]) {
        let msg = match ceph_snap::decode_snap_message(front) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping corrupt snap message");
                return;
            }
        };
        let applied = match msg {
            SnapMessage::Trace { op, realms } => self.snaps.apply_trace(&realms, op),
            SnapMessage::Split { new_realm_trace, split_inodes, split_child_realms } => {
                self.snaps.apply_split(&new_realm_trace, &split_inodes, &split_child_realms)
            }
        };
        match applied {
            Ok(leaf) => self.snaps.release_realm(leaf),
            Err(e) => warn!(error = %e, "dropping corrupt snap trace"),
        }
    }

    /// Closes a session (§4.1).
    pub fn close(&mut self, peer: PeerToken) {
        self.messenger.close(peer);
    }

    /// The bound listener's local address, e.g. to discover the ephemeral
    /// port chosen after binding `config.listen_addr` to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.messenger.local_addr()
    }

    /// This client's identity, as handed to peers during the connect handshake.
    pub fn identity(&self) -> Identity {
        self.messenger.identity()
    }

    /// Registers an inode as a cap holder so future trace applications and
    /// splits know to queue cap-snaps for it (§4.6-§4.8).
    pub fn register_inode(&self, ino: Ino, realm: Ino, mds_session: u32) {
        self.snaps.register_inode(ino, realm, mds_session);
    }

    /// Applies a snap trace (§4.6). See [`SnapEngine::apply_trace`].
    pub fn apply_snap_trace(&self, realms: &[EncodedRealm], op: SnapOp) -> Result<Ino> {
        Ok(self.snaps.apply_trace(realms, op)?)
    }

    /// Applies a realm split (§4.7). See [`SnapEngine::apply_split`].
    pub fn apply_snap_split(&self, new_realm_trace: &[EncodedRealm], split_inodes: &[Ino], split_child_realms: &[Ino]) -> Result<Ino> {
        Ok(self.snaps.apply_split(new_realm_trace, split_inodes, split_child_realms)?)
    }

    /// The current snap context for `ino` (§4.6).
    pub fn snap_context(&self, ino: Ino) -> std::sync::Arc<SnapContext> {
        self.snaps.snap_context(ino)
    }

    /// Releases a reference obtained from [`Self::apply_snap_trace`] or
    /// [`Self::apply_snap_split`].
    pub fn release_realm(&self, ino: Ino) {
        self.snaps.release_realm(ino);
    }

    /// Finishes the pending cap-snap on `ino` (§4.8).
    pub fn finish_cap_snap(&self, ino: Ino) -> Result<()> {
        Ok(self.snaps.finish_cap_snap(ino)?)
    }

    /// A writeback completion freed dirty pages for `ino`'s in-flight cap-snap (§4.8).
    pub fn writeback_complete(&self, ino: Ino, follows: u64, pages: u64) {
        self.snaps.writeback_complete(ino, follows, pages);
    }

    /// Drains the process-wide flush list through `sink` (§4.8).
    pub fn flush_snaps(&self, sink: &mut dyn SnapFlushSink) {
        self.snaps.flush_snaps(sink);
    }
}

/// A [`SnapFlushSink`] that routes a flushed cap-snap to whatever peer
/// session currently serves `mds_session`, via a caller-supplied lookup.
/// Kept outside `CephClient` itself: the mapping from `mds_session` to a
/// live [`PeerToken`] is MDS-session bookkeeping the messenger/snap crates
/// have no reason to know about.
pub struct MessengerFlushSink<'a, F> {
    pub client: &'a mut CephClient,
    pub resolve_session: F,
}

impl<F> SnapFlushSink for MessengerFlushSink<'_, F>
where
    F: FnMut(u32) -> Option<PeerToken>,
{
    fn send_cap_snap(&mut self, ino: Ino, mds_session: u32, capsnap: &CapSnap) -> bool {
        let Some(peer) = (self.resolve_session)(mds_session) else {
            return false;
        };
        let front = format!("cap_snap ino={ino:x} follows={}", capsnap.follows).into_bytes();
        let msg = ceph_messenger::Message::new(self.client.messenger.identity(), self.client.messenger.identity(), 0, front);
        self.client.send(peer, msg).is_ok()
    }
}
