//! Exchange protocol interface: the operation set every protocol driver provides,
//! the beacon/frame descriptors passed through it, and the per-context registry.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ggid::Ggid;
use crate::registry::ExchangeEntry;

/// Size of the child-side SSID area a protocol may fill before connecting.
pub const CHILD_SSID_LEN: usize = 24;

/// Smallest MP packet a protocol can rely on.
pub const PACKET_SIZE_MIN: u16 = 20;

/// Scanned beacon, as reported by the link driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeaconInfo {
    pub ggid: Ggid,
    /// Protocol-specific bytes stamped by the sender's `beacon_send`.
    pub user_info: Vec<u8>,
    pub parent_max_size: u16,
    pub child_max_size: u16,
}

/// Outgoing beacon parameters. Protocols may rewrite `user_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentParam {
    pub ggid: Ggid,
    pub user_info: Vec<u8>,
    pub parent_max_size: u16,
    pub child_max_size: u16,
}

/// One MP frame payload.
///
/// On send `data` starts empty and the protocol fills at most `capacity` bytes.
/// On receive `data` holds what arrived and `capacity` is the sender's slot size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub aid_bitmap: u16,
    pub capacity: u16,
    pub data: Vec<u8>,
}

impl PacketInfo {
    pub fn outgoing(aid_bitmap: u16, capacity: u16) -> Self {
        Self {
            aid_bitmap,
            capacity,
            data: Vec::with_capacity(capacity as usize),
        }
    }
}

/// Buffers of the block sequence currently driven by the session.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Block we send. Shared with the application, never copied.
    pub send: Arc<[u8]>,
    /// Block being received. Sized by the protocol once the peer's length is known.
    pub recv: Vec<u8>,
    /// Largest block we accept.
    pub recv_max: usize,
}

impl Transfer {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            send: Arc::from(Vec::new()),
            recv: Vec::new(),
            recv_max: 0,
        }
    }
}

/// Operation set of an exchange protocol.
///
/// Called only from the dispatcher, always for the entry currently bound to the session.
pub trait ProtocolImpl: Send {
    /// Name used by registration lookups.
    fn name(&self) -> &str;

    /// Start a new communication generation with the parent's packet sizes.
    fn init(&mut self, transfer: &mut Transfer, send_max: u16, recv_max: u16);

    /// Arm a block sequence. Returns false if a sequence is already in flight.
    fn add_data(&mut self, transfer: &mut Transfer, send: Arc<[u8]>, recv_max: usize) -> bool;

    /// Whether the protocol still wants the link.
    fn is_executing(&self) -> bool;

    fn beacon_send(&mut self, entry: &ExchangeEntry, param: &mut ParentParam);

    /// Protocol-level admission of a peer whose GGID already matched.
    fn beacon_recv(&mut self, beacon: &BeaconInfo) -> bool;

    fn pre_connect(
        &mut self,
        _entry: &ExchangeEntry,
        _beacon: &BeaconInfo,
        _ssid: &mut [u8; CHILD_SSID_LEN],
    ) {
    }

    fn packet_send(&mut self, transfer: &Transfer, packet: &mut PacketInfo);

    /// Returns true exactly when one block exchange has just completed.
    fn packet_recv(&mut self, transfer: &mut Transfer, packet: &PacketInfo) -> bool;

    fn on_connect(&mut self, _aid_bitmap: u16) {}

    fn on_disconnect(&mut self, _aid_bitmap: u16) {}
}

/// Shared handle to an installed protocol. The application keeps its own clone.
pub type ProtocolHandle = Arc<Mutex<dyn ProtocolImpl>>;

/// Wrap a protocol so it can be installed.
pub fn handle<P: ProtocolImpl + 'static>(protocol: P) -> ProtocolHandle {
    Arc::new(Mutex::new(protocol))
}

/// Append-only list of installed protocols.
#[derive(Default)]
pub struct ProtocolRegistry {
    installed: Vec<ProtocolHandle>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a protocol. Installing the same handle again is a no-op.
    pub fn install(&mut self, protocol: ProtocolHandle) {
        if self.installed.iter().any(|p| Arc::ptr_eq(p, &protocol)) {
            return;
        }
        tracing::debug!(name = %protocol.lock().name(), "protocol installed");
        self.installed.push(protocol);
    }

    /// First installed protocol whose name matches exactly.
    pub fn find(&self, name: &str) -> Option<ProtocolHandle> {
        self.installed
            .iter()
            .find(|p| p.lock().name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.installed.iter().map(|p| p.lock().name().to_string()).collect();
        f.debug_struct("ProtocolRegistry").field("installed", &names).finish()
    }
}
