//! Image transfer over the BLE link

pub mod packet;
pub mod sender;
pub mod session;
pub mod staging;
pub mod updater;

pub use packet::{
    encode_ack, encode_nack, Decoded, Decoder, ImageHeader, ImageKind, NackReason, OtaPacket,
    PacketType, Reply,
};
pub use sender::Sender;
pub use session::{Event, OtaEngine, OtaSession, OtaState, SessionStatus};
pub use staging::{FileStaging, FlashCall, FlashStaging, MemoryStaging};
pub use updater::{SessionOutcome, Updater};
