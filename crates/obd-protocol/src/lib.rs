//! OBD-II Protocol Implementation
//!
//! Async command/response framing, Mode 01 response parsing and adapter
//! initialization for ELM327-compatible adapters behind any duplex byte
//! stream (RFCOMM socket, serial tty, TCP bridge).

mod connection;
mod error;
pub mod framing;
mod initializer;
pub mod mock;
pub mod parser;
mod pid;
mod protocol;

pub use connection::{Connection, DuplexStream};
pub use error::{HandshakeError, ObdError, ParseError};
pub use framing::{ElmChannel, FramingConfig};
pub use initializer::{
    initialize, AdapterInitializer, AdapterState, InitConfig, ReadyAdapter, CONFIGURE_COMMANDS,
};
pub use parser::{FrameStyle, MATCH_ORDER};
pub use pid::{data_len, decode_value, Pid, PidResponse};
pub use protocol::{ObdProtocol, DEFAULT_CANDIDATES};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Response code for current data
    pub const CURRENT_DATA_RESPONSE: u8 = 0x41;
}
