pub mod bitfield;
pub mod message;

pub use bitfield::Bitfield;
pub use message::{Message, MessageError};
