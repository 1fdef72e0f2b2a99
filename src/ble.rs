//! HM-10 BLE module driver

mod command;
mod driver;
mod response;

use thiserror::Error;

pub use command::{
    validate_name, validate_pin, AddressType, AtCommand, BtAddress, PinCodeMode, Role, WorkMode,
    WorkType, MAX_NAME_LEN, PIN_LEN,
};
pub use driver::{
    ConnectionStatus, Hm10, LinkState, Mode, PendingRequest, DEFAULT_NAME, DEFAULT_PIN,
    DEFAULT_PIN_CODE_MODE, DEFAULT_ROLE, DEFAULT_WORK_MODE,
};
pub use response::{match_shapes, AtResponse, Match, Shape};

/// The failure code in an `OK+CO` connect reply
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ConnectFailure {
    /// `E`: the module rejected the request
    #[error("the module reported an error")]
    Error,
    /// `F`: the peer could not be reached
    #[error("the peer could not be reached")]
    Fail,
}
