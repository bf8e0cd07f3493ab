//! In-memory link driver: one parent and one child station joined by a perfect MP link.
//! Each frame both stations send, then both receive what the other sent.

use std::fmt;
use std::sync::Arc;

use passby_core::{
    handle, BeaconInfo, BlockExchange, Dispatcher, ExchangeCallback, ExchangeDone, Ggid,
    PacketInfo, ParentParam, Sequence, CHILD_SSID_LEN,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::config::SimConfig;

/// AID bit the parent uses for its single child.
const CHILD_AID_BIT: u16 = 0b10;
/// AID bit the child uses for the parent.
const PARENT_AID_BIT: u16 = 0b01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Child,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Parent => f.write_str("parent"),
            Role::Child => f.write_str("child"),
        }
    }
}

/// Completed block exchange reported by a station's callback.
pub type Completion = (Role, ExchangeDone);

/// What happened on one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    pub parent_done: bool,
    pub child_done: bool,
}

pub struct Link {
    parent: Dispatcher,
    child: Dispatcher,
    parent_max: u16,
    child_max: u16,
    connected: bool,
    frames: usize,
}

/// Deterministic payload so the receiving side can be checked by eye in the logs.
pub fn payload(len: usize, seed: u8) -> Arc<[u8]> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect::<Vec<u8>>()
        .into()
}

/// Reports each completion and re-arms the same block until `rounds` exchanges are done.
fn completion_callback(
    role: Role,
    rounds: u32,
    send: Arc<[u8]>,
    recv_max: usize,
    tx: UnboundedSender<Completion>,
) -> ExchangeCallback {
    let mut remaining = rounds;
    Box::new(move |done: ExchangeDone, seq: &mut Sequence<'_>| {
        remaining = remaining.saturating_sub(1);
        if remaining > 0 {
            seq.add_block_sequence(send.clone(), recv_max);
        }
        let _ = tx.send((role, done));
    })
}

fn station(
    role: Role,
    ggid: u32,
    send: Arc<[u8]>,
    recv_max: usize,
    cfg: &SimConfig,
    tx: UnboundedSender<Completion>,
) -> anyhow::Result<Dispatcher> {
    let mut d = Dispatcher::new();
    d.install_protocol(handle(BlockExchange::new()));
    let callback = completion_callback(role, cfg.rounds, send.clone(), recv_max, tx);
    let slot = d.register_with_initial(Ggid(ggid), Some(callback), send, recv_max, &cfg.protocol)?;
    debug!(%role, ggid = %Ggid(ggid), slot, "station ready");
    Ok(d)
}

impl Link {
    pub fn new(cfg: &SimConfig, tx: UnboundedSender<Completion>) -> anyhow::Result<Self> {
        let parent = station(
            Role::Parent,
            cfg.parent_ggid,
            payload(cfg.parent_payload, 0x5A),
            cfg.child_payload,
            cfg,
            tx.clone(),
        )?;
        let child = station(
            Role::Child,
            cfg.child_ggid,
            payload(cfg.child_payload, 0xA5),
            cfg.parent_payload,
            cfg,
            tx,
        )?;
        Ok(Self {
            parent,
            child,
            parent_max: cfg.parent_max,
            child_max: cfg.child_max,
            connected: false,
            frames: 0,
        })
    }

    /// Beacon from parent to child, match, pre-connect, then connect both ends.
    pub fn discover(&mut self) -> anyhow::Result<Ggid> {
        let advertised = self.parent.seek_next_entry();
        anyhow::ensure!(!advertised.is_empty(), "parent has nothing to advertise");

        let mut param = ParentParam {
            ggid: advertised,
            user_info: Vec::new(),
            parent_max_size: self.parent_max,
            child_max_size: self.child_max,
        };
        self.parent.on_beacon_send(&mut param);
        let beacon = BeaconInfo {
            ggid: param.ggid,
            user_info: param.user_info,
            parent_max_size: param.parent_max_size,
            child_max_size: param.child_max_size,
        };
        info!(ggid = %beacon.ggid, user_info = beacon.user_info.len(), "beacon");

        if !self.child.on_beacon_received(&beacon) {
            anyhow::bail!("child has no exchange matching {}", beacon.ggid);
        }
        let mut ssid = [0u8; CHILD_SSID_LEN];
        self.child.call_pre_connect_hook(&beacon, &mut ssid);
        debug!(ssid = ?&ssid[..8], "pre-connect");

        self.parent
            .on_connected(self.parent_max, self.child_max, CHILD_AID_BIT);
        self.child
            .on_connected(beacon.parent_max_size, beacon.child_max_size, PARENT_AID_BIT);
        self.connected = true;
        info!(
            parent = %self.parent.current_ggid(),
            child = %self.child.current_ggid(),
            "connected"
        );
        Ok(self.child.current_ggid())
    }

    /// One MP frame.
    pub fn step(&mut self) -> Frame {
        let mut down = PacketInfo::outgoing(CHILD_AID_BIT, self.parent_max);
        self.parent.on_packet_send(&mut down);
        let mut up = PacketInfo::outgoing(PARENT_AID_BIT, self.child_max);
        self.child.on_packet_send(&mut up);

        let frame = Frame {
            parent_done: self.parent.on_packet_received(&up),
            child_done: self.child.on_packet_received(&down),
        };
        self.frames += 1;
        frame
    }

    /// Whether either end still wants the link.
    pub fn is_executing(&self) -> bool {
        self.connected && (self.parent.is_executing() || self.child.is_executing())
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.parent.on_disconnected(CHILD_AID_BIT);
        self.child.on_disconnected(PARENT_AID_BIT);
        self.connected = false;
        debug!(frames = self.frames, "disconnected");
    }

    pub fn parent(&self) -> &Dispatcher {
        &self.parent
    }

    pub fn child(&self) -> &Dispatcher {
        &self.child
    }
}
