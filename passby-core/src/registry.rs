//! Exchange registry: fixed table of per-GGID entries (callback, protocol, initial buffers).

use std::fmt;
use std::sync::Arc;

use crate::dispatcher::{ExchangeDone, Sequence};
use crate::ggid::Ggid;
use crate::protocol::ProtocolHandle;

/// Number of slots in the exchange table.
pub const REGISTER_DATA_MAX: usize = 16;

/// Completion callback. Runs inline on the frame path; may re-arm through `Sequence`.
pub type ExchangeCallback = Box<dyn FnMut(ExchangeDone, &mut Sequence<'_>) + Send>;

/// Buffers for the automatic first exchange after connecting.
#[derive(Debug, Clone)]
pub struct InitialExchange {
    pub send: Arc<[u8]>,
    pub recv_max: usize,
}

/// One registry slot. `ggid == 0` means unused.
#[derive(Default)]
pub struct ExchangeEntry {
    ggid: Ggid,
    callback: Option<ExchangeCallback>,
    protocol: Option<ProtocolHandle>,
    initial: Option<InitialExchange>,
}

impl ExchangeEntry {
    /// Bind a GGID, callback and protocol to this slot, dropping any initial buffers.
    ///
    /// Panics if `ggid` is empty. Uniqueness across the table is the caller's concern.
    pub fn init(&mut self, ggid: Ggid, callback: Option<ExchangeCallback>, protocol: ProtocolHandle) {
        assert!(!ggid.is_empty(), "GGID 0 is reserved for unused slots");
        self.ggid = ggid;
        self.callback = callback;
        self.protocol = Some(protocol);
        self.initial = None;
    }

    pub fn set_initial_exchange(&mut self, send: Arc<[u8]>, recv_max: usize) {
        self.initial = Some(InitialExchange { send, recv_max });
    }

    /// Return the slot to the unused state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn ggid(&self) -> Ggid {
        self.ggid
    }

    pub fn is_empty(&self) -> bool {
        self.ggid.is_empty()
    }

    pub fn protocol(&self) -> Option<&ProtocolHandle> {
        self.protocol.as_ref()
    }

    pub fn initial_exchange(&self) -> Option<&InitialExchange> {
        self.initial.as_ref()
    }

    pub(crate) fn callback_mut(&mut self) -> Option<&mut ExchangeCallback> {
        self.callback.as_mut()
    }
}

impl fmt::Debug for ExchangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeEntry")
            .field("ggid", &self.ggid)
            .field("callback", &self.callback.is_some())
            .field("protocol", &self.protocol.as_ref().map(|p| p.lock().name().to_string()))
            .field("initial", &self.initial)
            .finish()
    }
}

/// Fixed-capacity table of exchange entries.
#[derive(Debug)]
pub struct ExchangeTable {
    entries: [ExchangeEntry; REGISTER_DATA_MAX],
}

impl Default for ExchangeTable {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| ExchangeEntry::default()),
        }
    }
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, slot: usize) -> Option<&ExchangeEntry> {
        self.entries.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ExchangeEntry> {
        self.entries.get_mut(slot)
    }

    /// Slots in table order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ExchangeEntry)> {
        self.entries.iter().enumerate()
    }

    /// Occupied slots in table order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ExchangeEntry)> {
        self.iter().filter(|(_, e)| !e.is_empty())
    }

    /// Circular scan starting right after `from` (slot 0 when `None`).
    ///
    /// Returns the first slot whose GGID equals `ggid` when `matching`, or differs from it
    /// otherwise. Every slot is examined once, `from` itself last.
    pub fn find_next(&self, from: Option<usize>, ggid: Ggid, matching: bool) -> Option<usize> {
        let n = self.entries.len();
        let start = match from {
            Some(slot) => (slot % n) + 1,
            None => 0,
        };
        (0..n)
            .map(|k| (start + k) % n)
            .find(|&slot| (self.entries[slot].ggid == ggid) == matching)
    }
}
