//! USB transport: trait, backends, and chunked message transfer.

pub mod chunk;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use chunk::{ChunkError, receive_chunk, receive_message, send_chunked, split_packets};
pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use traits::{TransportError, UsbTransport};
