//! Bridge transaction encoding

mod sender;

pub use sender::{classify_send_error, keccak, BridgeCall};
