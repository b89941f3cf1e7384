//! # ccwire
//!
//! Wire format for the chaincode stream protocol.
//!
//! - [`pack`]: a bounded tag-length-value encoder and a zero-copy decoder.
//! - [`message`]: the protocol records (`ChaincodeMessage`, `ChaincodeInput`,
//!   `Response`, `ChaincodeEvent`, `ChaincodeId`) and their field layout.
//! - [`frame`]: length-delimited framing of messages over async byte streams.

pub mod error;
pub mod frame;
pub mod message;
pub mod pack;

pub use error::WireError;
pub use frame::FrameError;
pub use frame::read_message;
pub use frame::write_message;
pub use message::ChaincodeEvent;
pub use message::ChaincodeId;
pub use message::ChaincodeInput;
pub use message::ChaincodeMessage;
pub use message::MessageType;
pub use message::Record;
pub use message::Response;
pub use pack::Decoder;
pub use pack::Encoder;
pub use pack::PackError;
