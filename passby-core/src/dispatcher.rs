//! Host-driven dispatcher: the link driver passes beacon, frame and link events in;
//! the dispatcher matches peers to registered exchanges and drives the bound protocol.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ggid::{wildcard_target, Ggid};
use crate::protocol::{
    BeaconInfo, PacketInfo, ParentParam, ProtocolHandle, ProtocolRegistry, Transfer,
    CHILD_SSID_LEN,
};
use crate::block::BLOCK_PROTOCOL_NAME;
use crate::registry::{ExchangeCallback, ExchangeEntry, ExchangeTable};

/// Application-level say on a beacon, consulted after the protocol's own check.
/// Gets the beacon, the resolved target GGID and the verdict so far; returns the final verdict.
pub type BeaconFilter = Box<dyn FnMut(&BeaconInfo, Ggid, bool) -> bool + Send>;

/// Passed to the exchange callback when one block exchange has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDone {
    /// GGID agreed with the peer for this session.
    pub ggid: Ggid,
    /// Block received from the peer.
    pub received: Vec<u8>,
}

/// Handle given to the exchange callback so it can continue the session.
pub struct Sequence<'a> {
    protocol: &'a ProtocolHandle,
    transfer: &'a mut Transfer,
    target_ggid: Ggid,
}

impl Sequence<'_> {
    /// Arm the next block exchange on the same link. Panics if a sequence is already running.
    pub fn add_block_sequence(&mut self, send: impl Into<Arc<[u8]>>, recv_max: usize) {
        arm(self.protocol, self.transfer, send.into(), recv_max);
    }

    pub fn target_ggid(&self) -> Ggid {
        self.target_ggid
    }
}

fn arm(protocol: &ProtocolHandle, transfer: &mut Transfer, send: Arc<[u8]>, recv_max: usize) {
    let send_len = send.len();
    let accepted = protocol.lock().add_data(transfer, send, recv_max);
    assert!(accepted, "sequence is now busy");
    debug!(send_len, recv_max, "block sequence armed");
}

/// The single exchange session: which entry is bound and what the peer agreed on.
#[derive(Debug, Default)]
pub struct Session {
    current: Option<usize>,
    target_ggid: Ggid,
    transfer: Transfer,
    user_bitmap: u16,
}

impl Session {
    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn target_ggid(&self) -> Ggid {
        self.target_ggid
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    fn bind(&mut self, slot: usize, target: Ggid) {
        self.current = Some(slot);
        self.target_ggid = target;
    }
}

/// Main coordinator. One instance per station; the link driver serializes all calls.
#[derive(Default)]
pub struct Dispatcher {
    protocols: ProtocolRegistry,
    table: ExchangeTable,
    session: Session,
    beacon_filter: Option<BeaconFilter>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("protocols", &self.protocols)
            .field("table", &self.table)
            .field("session", &self.session)
            .field("beacon_filter", &self.beacon_filter.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_protocol(&mut self, protocol: ProtocolHandle) {
        self.protocols.install(protocol);
    }

    pub fn find_protocol(&self, name: &str) -> Option<ProtocolHandle> {
        self.protocols.find(name)
    }

    pub fn table(&self) -> &ExchangeTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ExchangeTable {
        &mut self.table
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Entry bound to the session, if any.
    pub fn current_entry(&self) -> Option<&ExchangeEntry> {
        self.session.current.and_then(|slot| self.table.get(slot))
    }

    fn bound(&self) -> Option<(usize, ProtocolHandle)> {
        let slot = self.session.current?;
        let protocol = self.table.get(slot)?.protocol()?.clone();
        Some((slot, protocol))
    }

    /// Start a new communication generation with the parent's packet sizes.
    pub fn reset_sequence(&mut self, send_max: u16, recv_max: u16) {
        if let Some((_, protocol)) = self.bound() {
            protocol
                .lock()
                .init(&mut self.session.transfer, send_max, recv_max);
        }
    }

    /// Arm a block exchange. Panics when unbound or when a sequence is already running.
    pub fn add_block_sequence(&mut self, send: impl Into<Arc<[u8]>>, recv_max: usize) {
        let Some((_, protocol)) = self.bound() else {
            panic!("no exchange session is bound");
        };
        arm(&protocol, &mut self.session.transfer, send.into(), recv_max);
    }

    pub fn on_packet_send(&mut self, packet: &mut PacketInfo) {
        if let Some((_, protocol)) = self.bound() {
            protocol.lock().packet_send(&self.session.transfer, packet);
        }
    }

    /// Feed one received frame. Returns true when a block exchange completed on it;
    /// the entry's callback has already run by then.
    pub fn on_packet_received(&mut self, packet: &PacketInfo) -> bool {
        let Some((slot, protocol)) = self.bound() else {
            return false;
        };
        let done = protocol
            .lock()
            .packet_recv(&mut self.session.transfer, packet);
        if !done {
            return false;
        }

        let target_ggid = self.session.target_ggid;
        let received = std::mem::take(&mut self.session.transfer.recv);
        info!(ggid = %target_ggid, received = received.len(), "block exchange complete");
        if let Some(callback) = self.table.get_mut(slot).and_then(ExchangeEntry::callback_mut) {
            let mut sequence = Sequence {
                protocol: &protocol,
                transfer: &mut self.session.transfer,
                target_ggid,
            };
            callback(
                ExchangeDone {
                    ggid: target_ggid,
                    received,
                },
                &mut sequence,
            );
        }
        true
    }

    /// Let the bound protocol stamp the outgoing beacon. No-op when unbound.
    pub fn on_beacon_send(&mut self, param: &mut ParentParam) {
        if let Some((slot, protocol)) = self.bound() {
            if let Some(entry) = self.table.get(slot) {
                protocol.lock().beacon_send(entry, param);
            }
        }
    }

    /// Decide whether to pursue the sender of `beacon`. Binds the session on success.
    pub fn on_beacon_received(&mut self, beacon: &BeaconInfo) -> bool {
        let remote = beacon.ggid;
        if remote.is_empty() {
            return false;
        }
        let Some((slot, target)) = self.select_entry(remote) else {
            return false;
        };
        let Some(protocol) = self.table.get(slot).and_then(|e| e.protocol()).cloned() else {
            return false;
        };
        let mut matched = protocol.lock().beacon_recv(beacon);
        if let Some(filter) = self.beacon_filter.as_mut() {
            matched = filter(beacon, target, matched);
        }
        if !matched {
            debug!(remote = %remote, slot, "peer rejected");
            return false;
        }
        debug!(remote = %remote, target = %target, slot, "session bound");
        self.session.bind(slot, target);
        true
    }

    /// Exact match anywhere in the table wins; otherwise the first wildcard pairing.
    fn select_entry(&self, remote: Ggid) -> Option<(usize, Ggid)> {
        if let Some((slot, _)) = self.table.occupied().find(|(_, e)| e.ggid() == remote) {
            return Some((slot, remote));
        }
        self.table
            .occupied()
            .find_map(|(slot, e)| wildcard_target(remote, e.ggid()).map(|t| (slot, t)))
    }

    /// Install or clear the application-level beacon filter.
    pub fn set_beacon_filter(&mut self, filter: Option<BeaconFilter>) {
        self.beacon_filter = filter;
    }

    /// Let the bound protocol fill the child SSID before connecting.
    pub fn call_pre_connect_hook(&mut self, beacon: &BeaconInfo, ssid: &mut [u8; CHILD_SSID_LEN]) {
        if let Some((slot, protocol)) = self.bound() {
            if let Some(entry) = self.table.get(slot) {
                protocol.lock().pre_connect(entry, beacon, ssid);
            }
        }
    }

    pub fn on_link_connect(&mut self, aid_bitmap: u16) {
        if let Some((_, protocol)) = self.bound() {
            protocol.lock().on_connect(aid_bitmap);
        }
    }

    pub fn on_link_disconnect(&mut self, aid_bitmap: u16) {
        if let Some((_, protocol)) = self.bound() {
            protocol.lock().on_disconnect(aid_bitmap);
        }
    }

    /// Link is up: reset the sequence, start the entry's automatic first exchange if it
    /// has one, then notify the protocol.
    pub fn on_connected(&mut self, parent_max: u16, child_max: u16, aid_bitmap: u16) {
        let Some(initial) = self.current_entry().map(|e| e.initial_exchange().cloned()) else {
            warn!(aid_bitmap, "connected without a bound exchange");
            return;
        };
        self.session.user_bitmap |= aid_bitmap;
        self.reset_sequence(parent_max, child_max);
        if let Some(initial) = initial {
            self.add_block_sequence(initial.send, initial.recv_max);
        }
        self.on_link_connect(aid_bitmap);
    }

    /// Peers left. The session ends once nobody remains.
    pub fn on_disconnected(&mut self, aid_bitmap: u16) {
        self.on_link_disconnect(aid_bitmap);
        self.session.user_bitmap &= !aid_bitmap;
        if self.session.user_bitmap == 0 {
            self.end_session();
        }
    }

    /// Whether the bound protocol still wants the link.
    pub fn is_executing(&self) -> bool {
        self.bound()
            .map(|(_, protocol)| protocol.lock().is_executing())
            .unwrap_or(false)
    }

    /// Drop the binding; no further delegation happens for this session.
    pub fn end_session(&mut self) {
        if let Some(slot) = self.session.current {
            debug!(slot, "session ended");
        }
        self.session = Session::default();
    }

    pub fn user_bitmap(&self) -> u16 {
        self.session.user_bitmap
    }

    /// GGID of the current connection; the peer's resolved GGID when bound through `COMMON_ANY`.
    pub fn current_ggid(&self) -> Ggid {
        match self.current_entry() {
            Some(entry) if entry.ggid() == Ggid::COMMON_ANY => self.session.target_ggid,
            Some(entry) => entry.ggid(),
            None => Ggid::EMPTY,
        }
    }

    /// Parent side: bind the next registered entry after the current one and return the
    /// GGID to advertise. Returns `Ggid::EMPTY` when nothing is registered; the session is
    /// then left unbound rather than pointing at an empty slot.
    pub fn seek_next_entry(&mut self) -> Ggid {
        let slot = self
            .table
            .find_next(self.session.current, Ggid::EMPTY, false);
        match slot.and_then(|s| self.table.get(s).map(|e| (s, e.ggid()))) {
            Some((slot, ggid)) if !ggid.is_empty() => {
                self.session.bind(slot, ggid);
                ggid
            }
            _ => {
                self.session.current = None;
                Ggid::EMPTY
            }
        }
    }

    /// Register an exchange for `ggid` driven by the protocol installed as `protocol_name`.
    pub fn register(
        &mut self,
        ggid: Ggid,
        callback: Option<ExchangeCallback>,
        protocol_name: &str,
    ) -> Result<usize, RegisterError> {
        assert!(!ggid.is_empty(), "GGID 0 is reserved for unused slots");
        if self.table.find_next(None, ggid, true).is_some() {
            warn!(ggid = %ggid, "already registered same GGID");
            return Err(RegisterError::Duplicate(ggid));
        }
        let slot = self
            .table
            .find_next(None, Ggid::EMPTY, true)
            .ok_or(RegisterError::TableFull)?;
        let protocol = self
            .protocols
            .find(protocol_name)
            .ok_or_else(|| RegisterError::UnknownProtocol(protocol_name.to_string()))?;
        if let Some(entry) = self.table.get_mut(slot) {
            entry.init(ggid, callback, protocol);
        }
        debug!(ggid = %ggid, slot, protocol = protocol_name, "exchange registered");
        Ok(slot)
    }

    /// `register` plus the buffers for the automatic first exchange.
    pub fn register_with_initial(
        &mut self,
        ggid: Ggid,
        callback: Option<ExchangeCallback>,
        send: impl Into<Arc<[u8]>>,
        recv_max: usize,
        protocol_name: &str,
    ) -> Result<usize, RegisterError> {
        let slot = self.register(ggid, callback, protocol_name)?;
        if let Some(entry) = self.table.get_mut(slot) {
            entry.set_initial_exchange(send.into(), recv_max);
        }
        Ok(slot)
    }

    /// Register `ggid` in the common space (`ggid | COMMON_BIT`) driven by the built-in
    /// block protocol, with `send`/`recv_max` as the automatic first exchange.
    pub fn register_common(
        &mut self,
        ggid: Ggid,
        callback: Option<ExchangeCallback>,
        send: impl Into<Arc<[u8]>>,
        recv_max: usize,
    ) -> Result<usize, RegisterError> {
        self.register_with_initial(ggid.to_common(), callback, send, recv_max, BLOCK_PROTOCOL_NAME)
    }

    /// Replace the automatic first exchange of the entry registered as `ggid`.
    /// Returns false if no such entry exists.
    pub fn set_initial_data(&mut self, ggid: Ggid, send: impl Into<Arc<[u8]>>, recv_max: usize) -> bool {
        if ggid.is_empty() {
            return false;
        }
        match self
            .table
            .find_next(None, ggid, true)
            .and_then(|slot| self.table.get_mut(slot))
        {
            Some(entry) => {
                entry.set_initial_exchange(send.into(), recv_max);
                true
            }
            None => false,
        }
    }

    /// Remove the entry registered as `ggid` (or as its common form).
    pub fn unregister(&mut self, ggid: Ggid) -> Result<(), UnregisterError> {
        if ggid.is_empty() {
            return Err(UnregisterError::NotRegistered(ggid));
        }
        let slot = self
            .table
            .find_next(None, ggid, true)
            .or_else(|| self.table.find_next(None, ggid.to_common(), true))
            .ok_or(UnregisterError::NotRegistered(ggid))?;
        if self.session.current == Some(slot) {
            if self.session.user_bitmap != 0 {
                warn!(ggid = %ggid, "specified data is now in use");
                return Err(UnregisterError::InUse(ggid));
            }
            self.end_session();
        }
        if let Some(entry) = self.table.get_mut(slot) {
            entry.clear();
        }
        debug!(ggid = %ggid, slot, "exchange unregistered");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("GGID {0} is already registered")]
    Duplicate(Ggid),
    #[error("no free exchange slot")]
    TableFull,
    #[error("unknown protocol \"{0}\"")]
    UnknownProtocol(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnregisterError {
    #[error("GGID {0} is not registered")]
    NotRegistered(Ggid),
    #[error("GGID {0} is bound to a live connection")]
    InUse(Ggid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ggid::{COMMON_ANY, COMMON_PARENT};
    use crate::protocol::handle;
    use crate::protocol::testing::{Calls, ScriptedProtocol};
    use crate::registry::REGISTER_DATA_MAX;
    use parking_lot::Mutex;

    fn beacon(ggid: u32) -> BeaconInfo {
        BeaconInfo {
            ggid: Ggid(ggid),
            ..Default::default()
        }
    }

    fn packet(data: &[u8]) -> PacketInfo {
        PacketInfo {
            aid_bitmap: 0b10,
            capacity: 64,
            data: data.to_vec(),
        }
    }

    /// Dispatcher with one scripted protocol per name and the given (ggid, protocol) slots.
    fn dispatcher_with(entries: &[(u32, &str)]) -> (Dispatcher, Vec<(String, Arc<Mutex<Calls>>)>) {
        let mut d = Dispatcher::new();
        let mut calls = Vec::new();
        for &(ggid, name) in entries {
            if d.find_protocol(name).is_none() {
                let (p, c) = ScriptedProtocol::new(name);
                d.install_protocol(handle(p));
                calls.push((name.to_string(), c));
            }
            d.register(Ggid(ggid), None, name).unwrap();
        }
        (d, calls)
    }

    fn calls_for<'a>(calls: &'a [(String, Arc<Mutex<Calls>>)], name: &str) -> &'a Arc<Mutex<Calls>> {
        &calls.iter().find(|(n, _)| n == name).unwrap().1
    }

    #[test]
    fn wildcard_parent_beacon_picks_concrete_local() {
        let (mut d, calls) = dispatcher_with(&[(0x8000_0001, "A"), (COMMON_ANY, "B")]);
        assert!(d.on_beacon_received(&beacon(COMMON_PARENT)));
        assert_eq!(d.session().current_slot(), Some(0));
        assert_eq!(d.session().target_ggid(), Ggid(0x8000_0001));
        assert_eq!(calls_for(&calls, "A").lock().beacons_seen, vec![Ggid(COMMON_PARENT)]);
        assert!(calls_for(&calls, "B").lock().beacons_seen.is_empty());
    }

    #[test]
    fn wildcard_concrete_beacon_keeps_remote_ggid() {
        let (mut d, _) = dispatcher_with(&[(COMMON_ANY, "B")]);
        assert!(d.on_beacon_received(&beacon(0x8000_0002)));
        assert_eq!(d.session().current_slot(), Some(0));
        assert_eq!(d.session().target_ggid(), Ggid(0x8000_0002));
        assert_eq!(d.current_ggid(), Ggid(0x8000_0002));
    }

    #[test]
    fn parent_beacon_ignores_local_any() {
        let (mut d, _) = dispatcher_with(&[(COMMON_ANY, "B")]);
        assert!(!d.on_beacon_received(&beacon(COMMON_PARENT)));
        assert_eq!(d.session().current_slot(), None);
    }

    #[test]
    fn exact_match_beats_earlier_wildcard() {
        let (mut d, _) = dispatcher_with(&[(COMMON_ANY, "B"), (0x8000_0002, "A")]);
        assert!(d.on_beacon_received(&beacon(0x8000_0002)));
        assert_eq!(d.session().current_slot(), Some(1));
        assert_eq!(d.session().target_ggid(), Ggid(0x8000_0002));
    }

    #[test]
    fn ordinary_ggid_needs_exact_match() {
        let (mut d, _) = dispatcher_with(&[(COMMON_ANY, "B"), (0x0000_0300, "A")]);
        assert!(!d.on_beacon_received(&beacon(0x0000_0301)));
        assert!(d.on_beacon_received(&beacon(0x0000_0300)));
        assert_eq!(d.session().current_slot(), Some(1));
    }

    #[test]
    fn empty_beacon_leaves_session_untouched() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A"), (0x20, "A")]);
        assert!(d.on_beacon_received(&beacon(0x20)));
        assert!(!d.on_beacon_received(&beacon(0)));
        assert_eq!(d.session().current_slot(), Some(1));
        assert_eq!(d.session().target_ggid(), Ggid(0x20));
    }

    #[test]
    fn protocol_veto_leaves_session_untouched() {
        let mut d = Dispatcher::new();
        let (mut p, calls) = ScriptedProtocol::new("A");
        p.accept = false;
        d.install_protocol(handle(p));
        d.register(Ggid(0x10), None, "A").unwrap();
        assert!(!d.on_beacon_received(&beacon(0x10)));
        assert_eq!(d.session().current_slot(), None);
        assert_eq!(calls.lock().beacons_seen.len(), 1);
    }

    #[test]
    fn unregistered_slot_is_never_matched() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        d.unregister(Ggid(0x10)).unwrap();
        assert!(d.table().occupied().next().is_none());
        assert!(!d.on_beacon_received(&beacon(0x10)));
    }

    #[test]
    fn beacon_send_only_when_bound() {
        let (mut d, calls) = dispatcher_with(&[(0x10, "A")]);
        let mut param = ParentParam::default();
        d.on_beacon_send(&mut param);
        assert!(param.user_info.is_empty());
        assert_eq!(d.seek_next_entry(), Ggid(0x10));
        d.on_beacon_send(&mut param);
        assert_eq!(param.user_info, b"A".to_vec());
        assert_eq!(calls_for(&calls, "A").lock().beacons_sent, 1);
    }

    #[test]
    fn pre_connect_hook_writes_ssid() {
        let (mut d, calls) = dispatcher_with(&[(0x1234, "A")]);
        let mut ssid = [0u8; CHILD_SSID_LEN];
        d.call_pre_connect_hook(&beacon(0x1234), &mut ssid);
        assert_eq!(calls_for(&calls, "A").lock().pre_connects, 0);
        assert!(d.on_beacon_received(&beacon(0x1234)));
        d.call_pre_connect_hook(&beacon(0x1234), &mut ssid);
        assert_eq!(&ssid[..4], &0x1234u32.to_le_bytes());
    }

    #[test]
    #[should_panic(expected = "sequence is now busy")]
    fn overlapping_block_sequence_panics() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        assert!(d.on_beacon_received(&beacon(0x10)));
        d.on_connected(64, 64, 0b10);
        d.add_block_sequence(vec![1u8], 4);
        d.add_block_sequence(vec![2u8], 4);
    }

    #[test]
    #[should_panic(expected = "no exchange session is bound")]
    fn block_sequence_without_session_panics() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        d.add_block_sequence(vec![1u8], 4);
    }

    #[test]
    fn packets_are_ignored_when_unbound() {
        let (mut d, calls) = dispatcher_with(&[(0x10, "A")]);
        let mut out = PacketInfo::outgoing(0b10, 64);
        d.on_packet_send(&mut out);
        assert!(!d.on_packet_received(&packet(&[1, 2])));
        let c = calls_for(&calls, "A").lock();
        assert_eq!(c.packets_sent, 0);
        assert_eq!(c.packets_seen, 0);
    }

    #[test]
    fn callback_rearm_continues_session() {
        let mut d = Dispatcher::new();
        let (p, calls) = ScriptedProtocol::new("A");
        d.install_protocol(handle(p));
        let log: Arc<Mutex<Vec<ExchangeDone>>> = Arc::new(Mutex::new(Vec::new()));
        let log_cb = log.clone();
        let callback: ExchangeCallback = Box::new(move |done: ExchangeDone, seq: &mut Sequence<'_>| {
            let first = log_cb.lock().is_empty();
            log_cb.lock().push(done);
            if first {
                seq.add_block_sequence(vec![9u8, 9], 4);
            }
        });
        d.register(Ggid(0x10), Some(callback), "A").unwrap();

        assert!(d.on_beacon_received(&beacon(0x10)));
        d.on_connected(64, 48, 0b10);
        d.add_block_sequence(vec![1u8, 2], 8);

        assert!(!d.on_packet_received(&packet(&[0, 5])));
        assert!(d.on_packet_received(&packet(&[1, 7, 7])));

        // Re-armed inside the callback: the next frame carries the new block.
        let mut out = PacketInfo::outgoing(0b10, 64);
        d.on_packet_send(&mut out);
        assert_eq!(out.data, vec![9, 9]);

        assert!(d.on_packet_received(&packet(&[1, 8])));
        assert!(!d.on_packet_received(&packet(&[1, 6])));

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].received, vec![7, 7]);
        assert_eq!(log[1].received, vec![8]);
        assert!(log.iter().all(|done| done.ggid == Ggid(0x10)));

        let c = calls.lock();
        assert_eq!(c.init, vec![(64, 48)]);
        assert_eq!(c.added, vec![(vec![1, 2], 8), (vec![9, 9], 4)]);
        assert_eq!(c.beacons_seen.len(), 1);
    }

    #[test]
    fn connect_starts_initial_exchange_and_disconnect_ends_session() {
        let mut d = Dispatcher::new();
        let (p, calls) = ScriptedProtocol::new("A");
        d.install_protocol(handle(p));
        d.register_with_initial(Ggid(0x10), None, vec![4u8, 5, 6], 16, "A")
            .unwrap();

        assert!(d.on_beacon_received(&beacon(0x10)));
        d.on_connected(100, 60, 0b01);
        assert_eq!(d.user_bitmap(), 0b01);
        assert!(d.is_executing());
        {
            let c = calls.lock();
            assert_eq!(c.init, vec![(100, 60)]);
            assert_eq!(c.added, vec![(vec![4, 5, 6], 16)]);
            assert_eq!(c.connects, vec![0b01]);
        }

        d.on_disconnected(0b01);
        assert_eq!(calls.lock().disconnects, vec![0b01]);
        assert_eq!(d.session().current_slot(), None);
        assert!(!d.is_executing());
        assert_eq!(d.current_ggid(), Ggid::EMPTY);
    }

    #[test]
    fn raw_link_hooks_only_forward() {
        let (mut d, calls) = dispatcher_with(&[(0x10, "A")]);
        assert!(d.on_beacon_received(&beacon(0x10)));
        d.on_link_connect(0b100);
        d.on_link_disconnect(0b100);
        let c = calls_for(&calls, "A").lock();
        assert_eq!(c.connects, vec![0b100]);
        assert_eq!(c.disconnects, vec![0b100]);
        drop(c);
        assert_eq!(d.session().current_slot(), Some(0));
    }

    #[test]
    fn register_errors() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        assert_eq!(
            d.register(Ggid(0x10), None, "A"),
            Err(RegisterError::Duplicate(Ggid(0x10)))
        );
        assert_eq!(
            d.register(Ggid(0x11), None, "NOPE"),
            Err(RegisterError::UnknownProtocol("NOPE".to_string()))
        );
        for g in 1..REGISTER_DATA_MAX as u32 {
            d.register(Ggid(0x100 + g), None, "A").unwrap();
        }
        assert_eq!(d.register(Ggid(0x999), None, "A"), Err(RegisterError::TableFull));
    }

    #[test]
    #[should_panic(expected = "GGID 0 is reserved")]
    fn register_empty_ggid_panics() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        let _ = d.register(Ggid::EMPTY, None, "A");
    }

    #[test]
    fn beacon_filter_overrides_accepted_peer() {
        let (mut d, calls) = dispatcher_with(&[(0x8000_0001, "A")]);
        let seen: Arc<Mutex<Vec<(Ggid, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        d.set_beacon_filter(Some(Box::new(move |_: &BeaconInfo, target: Ggid, matched: bool| {
            seen_cb.lock().push((target, matched));
            false
        })));

        assert!(!d.on_beacon_received(&beacon(COMMON_PARENT)));
        assert_eq!(d.session().current_slot(), None);
        assert_eq!(d.session().target_ggid(), Ggid::EMPTY);
        assert_eq!(calls_for(&calls, "A").lock().beacons_seen.len(), 1);
        assert_eq!(*seen.lock(), vec![(Ggid(0x8000_0001), true)]);

        // No candidate entry: the filter is not consulted.
        assert!(!d.on_beacon_received(&beacon(0x0000_0099)));
        assert_eq!(seen.lock().len(), 1);

        d.set_beacon_filter(None);
        assert!(d.on_beacon_received(&beacon(COMMON_PARENT)));
        assert_eq!(d.session().current_slot(), Some(0));
    }

    #[test]
    fn beacon_filter_can_admit_protocol_rejection() {
        let mut d = Dispatcher::new();
        let (mut p, _) = ScriptedProtocol::new("A");
        p.accept = false;
        d.install_protocol(handle(p));
        d.register(Ggid(0x10), None, "A").unwrap();
        d.set_beacon_filter(Some(Box::new(|_: &BeaconInfo, _: Ggid, matched: bool| !matched)));
        assert!(d.on_beacon_received(&beacon(0x10)));
        assert_eq!(d.session().target_ggid(), Ggid(0x10));
    }

    #[test]
    fn register_common_sets_common_bit_and_block_protocol() {
        let mut d = Dispatcher::new();
        assert_eq!(
            d.register_common(Ggid(0x42), None, vec![1u8, 2, 3], 8),
            Err(RegisterError::UnknownProtocol(BLOCK_PROTOCOL_NAME.to_string()))
        );

        d.install_protocol(handle(crate::block::BlockExchange::new()));
        let slot = d.register_common(Ggid(0x42), None, vec![1u8, 2, 3], 8).unwrap();
        let entry = d.table().get(slot).unwrap();
        assert_eq!(entry.ggid(), Ggid(0x8000_0042));
        assert_eq!(entry.protocol().unwrap().lock().name(), BLOCK_PROTOCOL_NAME);
        let initial = entry.initial_exchange().unwrap();
        assert_eq!(&initial.send[..], &[1, 2, 3]);
        assert_eq!(initial.recv_max, 8);

        // Already common: registering the common form again is a duplicate.
        assert_eq!(
            d.register_common(Ggid(0x8000_0042), None, vec![0u8], 1),
            Err(RegisterError::Duplicate(Ggid(0x8000_0042)))
        );

        // A wildcard parent beacon pairs with it, and the plain GGID unregisters it.
        assert!(d.on_beacon_received(&beacon(COMMON_PARENT)));
        assert_eq!(d.current_ggid(), Ggid(0x8000_0042));
        d.end_session();
        d.unregister(Ggid(0x42)).unwrap();
        assert!(d.table().occupied().next().is_none());
    }

    #[test]
    fn unregister_falls_back_to_common_form() {
        let (mut d, _) = dispatcher_with(&[(0x8000_0042, "A")]);
        d.unregister(Ggid(0x42)).unwrap();
        assert_eq!(
            d.unregister(Ggid(0x42)),
            Err(UnregisterError::NotRegistered(Ggid(0x42)))
        );
    }

    #[test]
    fn unregister_refuses_live_entry() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        assert!(d.on_beacon_received(&beacon(0x10)));
        d.on_connected(64, 64, 0b10);
        assert_eq!(d.unregister(Ggid(0x10)), Err(UnregisterError::InUse(Ggid(0x10))));
        d.on_disconnected(0b10);
        assert_eq!(d.unregister(Ggid(0x10)), Ok(()));
    }

    #[test]
    fn set_initial_data_targets_registered_entry() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A")]);
        assert!(d.set_initial_data(Ggid(0x10), vec![1u8], 2));
        assert!(!d.set_initial_data(Ggid(0x11), vec![1u8], 2));
        let initial = d.table().get(0).and_then(|e| e.initial_exchange()).unwrap();
        assert_eq!(&initial.send[..], &[1]);
        assert_eq!(initial.recv_max, 2);
    }

    #[test]
    fn seek_rotates_through_registered_entries() {
        let (mut d, _) = dispatcher_with(&[(0x10, "A"), (0x20, "A")]);
        d.unregister(Ggid(0x10)).unwrap();
        d.register(Ggid(0x30), None, "A").unwrap(); // lands in slot 0
        assert_eq!(d.seek_next_entry(), Ggid(0x30));
        assert_eq!(d.seek_next_entry(), Ggid(0x20));
        assert_eq!(d.seek_next_entry(), Ggid(0x30));

        let mut empty = Dispatcher::new();
        assert_eq!(empty.seek_next_entry(), Ggid::EMPTY);
        assert_eq!(empty.session().current_slot(), None);
    }
}
