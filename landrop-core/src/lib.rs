//! LAN file-sharing core: wire protocol, transfer state, persistence.
//! No network I/O here; the daemon crate owns sockets and scheduling.

pub mod chunk;
pub mod identity;
pub mod integrity;
pub mod manager;
pub mod protocol;
pub mod record;
pub mod store;
pub mod trust;
pub mod wire;

pub use chunk::{ChunkSet, DEFAULT_CHUNK_SIZE};
pub use identity::DeviceIdentity;
pub use manager::{FlushPolicy, TransferHandle, TransferManager};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use record::{TransferDescriptor, TransferRecord, TransferRole};
pub use store::{StateStore, StoreError};
pub use trust::{PeerRecord, TrustManager};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
