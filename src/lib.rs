pub mod ble;
mod clock;
mod config;
pub mod crc;
mod error;
pub mod ota;
mod transport;

#[cfg(test)]
mod testing;

pub use clock::{Clock, MonotonicClock};
pub use config::Config;
pub use error::{Error, FlashError, SessionError};
pub use transport::{SerialTransport, Transport};

pub use serialport;
