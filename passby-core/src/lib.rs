//! Pass-by exchange dispatcher.
//! Host-driven: no I/O; the link driver passes beacon, frame and link events in.

pub mod block;
pub mod dispatcher;
pub mod ggid;
pub mod integrity;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use block::{BlockExchange, BLOCK_PROTOCOL_NAME, INDEX_NONE, MAX_DATA_SIZE};
pub use dispatcher::{
    BeaconFilter, Dispatcher, ExchangeDone, RegisterError, Sequence, UnregisterError,
};
pub use ggid::{wildcard_target, Ggid, GgidClass, COMMON_ANY, COMMON_BIT, COMMON_PARENT};
pub use protocol::{
    handle, BeaconInfo, PacketInfo, ParentParam, ProtocolHandle, ProtocolImpl, ProtocolRegistry,
    Transfer, CHILD_SSID_LEN, PACKET_SIZE_MIN,
};
pub use registry::{ExchangeCallback, ExchangeEntry, ExchangeTable, REGISTER_DATA_MAX};
