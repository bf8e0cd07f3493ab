//! Block exchange protocol ("COMMON"): each sequence swaps one block in each direction.
//! Blocks are split into segments sized to each side's MP slot; the receiver tracks
//! missing segments in a bitmap and keeps requesting the next hole until it has them all.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::integrity;
use crate::protocol::{
    BeaconInfo, PacketInfo, ParentParam, ProtocolImpl, Transfer, CHILD_SSID_LEN, PACKET_SIZE_MIN,
};
use crate::registry::ExchangeEntry;
use crate::wire::{
    self, BeaconFormat, BlockHeader, Phase, SsidFormat, SEGMENT_HEADER_LEN, SSID_HEADER,
};

/// Name the block protocol registers under.
pub const BLOCK_PROTOCOL_NAME: &str = "COMMON";

/// Segment index meaning "nothing requested" / "nothing carried".
pub const INDEX_NONE: u16 = 0x7FFF;

/// Largest block a station will accept.
pub const MAX_DATA_SIZE: usize = 32 * 1024;

/// Fields shared by both packet kinds once decoded.
struct Incoming {
    ack: bool,
    turn: bool,
    recv_arg: u32,
    send_arg: u32,
    checksum: u8,
}

#[derive(Debug)]
pub struct BlockExchange {
    parent_send: u16,
    child_send: u16,
    executing: bool,

    req_phase: Phase,
    turn: bool,
    ack_phase: Phase,

    send_checksum: u8,
    peer_recv_max: usize,
    peer_checksum: u8,
    recv_len: usize,

    own_segment: usize,
    peer_segment: usize,
    /// Segment we ask the peer for next.
    req_index: u16,
    /// Segment the peer asked us for.
    ack_index: u16,
    received: Vec<bool>,
    recv_count: usize,
}

impl Default for BlockExchange {
    fn default() -> Self {
        Self {
            parent_send: PACKET_SIZE_MIN,
            child_send: PACKET_SIZE_MIN,
            executing: false,
            req_phase: Phase::Idle,
            turn: false,
            ack_phase: Phase::Idle,
            send_checksum: 0,
            peer_recv_max: 0,
            peer_checksum: 0,
            recv_len: 0,
            own_segment: 0,
            peer_segment: 0,
            req_index: 0,
            ack_index: 0,
            received: Vec::new(),
            recv_count: 0,
        }
    }
}

impl BlockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.req_phase
    }

    /// Init handshake: record what the peer announced and check both blocks fit.
    fn on_init(&mut self, transfer: &mut Transfer, incoming: &Incoming, capacity: u16) {
        if self.req_phase != Phase::Init {
            return;
        }
        self.peer_recv_max = incoming.recv_arg as usize;
        self.peer_checksum = incoming.checksum;
        self.recv_len = incoming.send_arg as usize;
        if transfer.send.len() > self.peer_recv_max || self.recv_len > transfer.recv_max {
            warn!(
                send = transfer.send.len(),
                peer_recv_max = self.peer_recv_max,
                recv = self.recv_len,
                recv_max = transfer.recv_max,
                "not enough buffer length for data exchange"
            );
            self.req_phase = Phase::Quit;
            return;
        }
        if incoming.ack {
            self.prepare_data(transfer, capacity);
        }
    }

    /// Enter the data phase. Which slot is ours follows from the size of the peer's packet.
    fn prepare_data(&mut self, transfer: &mut Transfer, capacity: u16) {
        self.req_phase = Phase::Data;
        let (own, peer) = if capacity == self.child_send {
            (self.parent_send, self.child_send)
        } else {
            (self.child_send, self.parent_send)
        };
        self.own_segment = own as usize - SEGMENT_HEADER_LEN;
        self.peer_segment = peer as usize - SEGMENT_HEADER_LEN;
        self.req_index = 0;
        self.ack_index = 0;
        self.recv_count = 0;
        let total = (self.recv_len + self.peer_segment - 1) / self.peer_segment;
        self.received = vec![false; total];
        transfer.recv = vec![0; self.recv_len];
        debug!(
            own_segment = self.own_segment,
            peer_segment = self.peer_segment,
            segments = total,
            "data phase"
        );
    }

    fn on_segment(&mut self, transfer: &mut Transfer, incoming: &Incoming, payload: &[u8]) {
        self.ack_index = incoming.recv_arg as u16;

        let index = incoming.send_arg as usize;
        if incoming.send_arg != INDEX_NONE as u32
            && index < self.received.len()
            && !self.received[index]
        {
            let start = self.peer_segment * index;
            let end = (start + self.peer_segment).min(transfer.recv.len());
            if payload.len() >= end - start {
                transfer.recv[start..end].copy_from_slice(&payload[..end - start]);
                self.received[index] = true;
                self.recv_count += 1;
            } else {
                warn!(index, len = payload.len(), "short segment dropped");
            }
        }

        let total = self.received.len();
        if self.recv_count < total {
            let from = self.req_index as usize;
            self.req_index = (1..=total)
                .map(|k| (from + k) % total)
                .find(|&i| !self.received[i])
                .map(|i| i as u16)
                .unwrap_or(INDEX_NONE);
        } else {
            self.req_index = INDEX_NONE;
            if self.ack_index == INDEX_NONE {
                self.req_phase = Phase::Done;
            }
        }
    }
}

impl ProtocolImpl for BlockExchange {
    fn name(&self) -> &str {
        BLOCK_PROTOCOL_NAME
    }

    fn init(&mut self, transfer: &mut Transfer, send_max: u16, recv_max: u16) {
        transfer.clear();
        self.parent_send = send_max.max(PACKET_SIZE_MIN);
        self.child_send = recv_max.max(PACKET_SIZE_MIN);
        self.req_phase = Phase::Quit;
        self.turn = false;
        self.ack_phase = Phase::Idle;
        self.executing = true;
    }

    fn add_data(&mut self, transfer: &mut Transfer, send: Arc<[u8]>, recv_max: usize) -> bool {
        if self.req_phase != Phase::Quit {
            return false;
        }
        self.send_checksum = integrity::checksum8(&send);
        transfer.send = send;
        transfer.recv = Vec::new();
        transfer.recv_max = recv_max.min(MAX_DATA_SIZE);
        self.req_phase = Phase::Init;
        self.ack_phase = Phase::Idle;
        true
    }

    fn is_executing(&self) -> bool {
        self.executing
    }

    fn beacon_send(&mut self, entry: &ExchangeEntry, param: &mut ParentParam) {
        let format = BeaconFormat {
            send_length: entry
                .initial_exchange()
                .map_or(0, |initial| initial.send.len() as u32),
        };
        match wire::encode_record(&format) {
            Ok(bytes) => param.user_info = bytes,
            Err(e) => warn!(error = %e, "beacon info not set"),
        }
    }

    fn beacon_recv(&mut self, beacon: &BeaconInfo) -> bool {
        if let Ok(format) = wire::decode_record::<BeaconFormat>(&beacon.user_info) {
            trace!(ggid = %beacon.ggid, send_length = format.send_length, "common beacon");
        }
        true
    }

    fn pre_connect(
        &mut self,
        entry: &ExchangeEntry,
        _beacon: &BeaconInfo,
        ssid: &mut [u8; CHILD_SSID_LEN],
    ) {
        let format = SsidFormat {
            header: SSID_HEADER,
            ggid: entry.ggid().as_u32(),
        };
        match wire::encode_record(&format) {
            Ok(bytes) => ssid[..bytes.len()].copy_from_slice(&bytes),
            Err(e) => warn!(error = %e, "ssid not set"),
        }
    }

    fn packet_send(&mut self, transfer: &Transfer, packet: &mut PacketInfo) {
        let (header, payload): (BlockHeader, &[u8]) = match self.req_phase {
            Phase::Data | Phase::Done => {
                let mut payload: &[u8] = &[];
                if self.ack_index != INDEX_NONE {
                    let len = transfer.send.len();
                    let start = (self.own_segment * self.ack_index as usize).min(len);
                    let end = (start + self.own_segment).min(len);
                    payload = &transfer.send[start..end];
                }
                let header = BlockHeader::Segment {
                    turn: self.turn,
                    request: self.req_index,
                    index: self.ack_index,
                };
                (header, payload)
            }
            _ => {
                let header = BlockHeader::Command {
                    ack: self.ack_phase == self.req_phase,
                    turn: self.turn,
                    phase: self.req_phase,
                    checksum: self.send_checksum,
                    recv_max: transfer.recv_max as u32,
                    send_len: transfer.send.len() as u32,
                };
                (header, &[] as &[u8])
            }
        };
        trace!(?header, payload = payload.len(), "send");
        match wire::encode_packet(&header, payload, packet.capacity as usize) {
            Ok(bytes) => packet.data = bytes,
            Err(e) => warn!(error = %e, "block packet dropped"),
        }
    }

    fn packet_recv(&mut self, transfer: &mut Transfer, packet: &PacketInfo) -> bool {
        let (header, payload) = match wire::decode_packet(&packet.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "not enough length");
                return false;
            }
        };
        trace!(?header, payload = payload.len(), "recv");

        let incoming = match header {
            BlockHeader::Segment {
                turn,
                request,
                index,
            } => {
                self.ack_phase = if request == INDEX_NONE && index == INDEX_NONE {
                    Phase::Done
                } else {
                    Phase::Data
                };
                Incoming {
                    ack: false,
                    turn,
                    recv_arg: request as u32,
                    send_arg: index as u32,
                    checksum: 0,
                }
            }
            BlockHeader::Command {
                ack,
                turn,
                phase,
                checksum,
                recv_max,
                send_len,
            } => {
                self.ack_phase = phase;
                Incoming {
                    ack,
                    turn,
                    recv_arg: recv_max,
                    send_arg: send_len,
                    checksum,
                }
            }
        };

        let mut done = false;
        if incoming.turn != self.turn {
            // The peer already flipped its turn: our exchange finished on its side.
            done = self.req_phase == Phase::Done;
        } else {
            match self.ack_phase {
                Phase::Init => self.on_init(transfer, &incoming, packet.capacity),
                Phase::Data => {
                    if self.req_phase == Phase::Init {
                        self.prepare_data(transfer, packet.capacity);
                    }
                    if self.req_phase == Phase::Data {
                        self.on_segment(transfer, &incoming, payload);
                    }
                }
                Phase::Done => {
                    if self.req_phase == Phase::Data {
                        self.ack_index = incoming.recv_arg as u16;
                        if self.ack_index == INDEX_NONE && self.req_index == INDEX_NONE {
                            self.req_phase = Phase::Done;
                        }
                    }
                    done = self.req_phase == Phase::Done;
                }
                Phase::Quit => {
                    self.req_phase = Phase::Quit;
                    if incoming.ack {
                        self.executing = false;
                    }
                }
                Phase::Idle => {}
            }
        }

        if done {
            if !integrity::verify_block(&transfer.recv, self.peer_checksum) {
                warn!(len = transfer.recv.len(), "checksum error");
            }
            self.turn = !self.turn;
            self.req_phase = Phase::Quit;
        }
        done
    }
}
