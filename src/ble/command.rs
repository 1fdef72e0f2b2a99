use std::fmt;
use std::io::Write;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::response::Shape;
use crate::Error;

/// Longest name the module accepts
pub const MAX_NAME_LEN: usize = 12;

/// Number of digits in a PIN
pub const PIN_LEN: usize = 6;

/// Longest reply accepted for a raw command
const MAX_RAW_REPLY_LEN: usize = 64;

/// The GAP role of the module
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Role {
    Peripheral = b'0',
    Central = b'1',
}

/// Whether pairing requires the PIN (`AT+TYPE`)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum PinCodeMode {
    Disabled = b'0',
    Enabled = b'2',
}

/// Module work mode (`AT+MODE`)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum WorkMode {
    /// Pure transparent transmission
    Transmission = b'0',
    /// Transmission plus PIO collection
    PioCollection = b'1',
    /// Transmission plus remote PIO control
    PioRemoteControl = b'2',
}

/// What the module does at power on (`AT+IMME`)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum WorkType {
    /// Advertise and accept connections immediately
    Immediate = b'0',
    /// Only answer AT commands until `AT+START`
    WaitForStart = b'1',
}

/// Address type used when connecting to a peer (`AT+CO`)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum AddressType {
    Normal = b'N',
    StaticMac = b'0',
    StaticRandomMac = b'1',
    RandomMac = b'2',
}

/// A 48-bit Bluetooth device address
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct BtAddress([u8; 6]);

impl BtAddress {
    pub fn new(bytes: [u8; 6]) -> BtAddress {
        BtAddress(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parses the 12 hex digit form the module uses on the wire
    pub fn from_ascii(digits: &[u8]) -> Result<BtAddress, Error> {
        let text = std::str::from_utf8(digits)
            .map_err(|_| Error::InvalidValue(format!("address {:02x?}", digits)))?;

        text.parse()
    }

    /// The 12 hex digit form the module uses on the wire
    pub fn to_ascii(&self) -> String {
        self.0.iter().map(|octet| format!("{:02X}", octet)).collect()
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|octet| format!("{:02X}", octet)).collect();

        write!(f, "{}", parts.join(":"))
    }
}

impl fmt::Debug for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BtAddress({})", self)
    }
}

impl FromStr for BtAddress {
    type Err = Error;

    /// Accepts `001122AABBCC` as well as `00:11:22:AA:BB:CC`
    fn from_str(s: &str) -> Result<BtAddress, Error> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidValue(format!("address {:?}", s)));
        }

        let mut octets = [0u8; 6];

        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidValue(format!("address {:?}", s)))?;
        }

        Ok(BtAddress(octets))
    }
}

/// An AT command understood by the HM-10.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AtCommand {
    /// `AT`; answers `OK`, or `OK+LOST` when it tore down a connection
    Test,
    /// `AT+START`; leaves the wait-for-start state and begins transparent operation
    Start,
    /// `AT+RENEW`; factory defaults
    Renew,
    /// `AT+RESET`
    Reset,
    GetName,
    SetName(String),
    GetRole,
    SetRole(Role),
    GetPin,
    SetPin(String),
    GetPinCodeMode,
    SetPinCodeMode(PinCodeMode),
    GetWorkMode,
    SetWorkMode(WorkMode),
    GetWorkType,
    SetWorkType(WorkType),
    /// `AT+NOTI`; report `OK+CONN` / `OK+LOST` on the serial line
    SetNotify(bool),
    GetAddress,
    Connect {
        address: BtAddress,
        address_type: AddressType,
    },
    /// Any other command, answered by some `OK` reply
    Raw(String),
}

impl AtCommand {
    /// Serializes the command as it goes out on the wire
    pub fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        match self {
            AtCommand::Test => writer.write_all(b"AT")?,
            AtCommand::Start => writer.write_all(b"AT+START")?,
            AtCommand::Renew => writer.write_all(b"AT+RENEW")?,
            AtCommand::Reset => writer.write_all(b"AT+RESET")?,
            AtCommand::GetName => writer.write_all(b"AT+NAME?")?,
            AtCommand::SetName(name) => {
                writer.write_all(b"AT+NAME")?;
                writer.write_all(name.as_bytes())?;
            }
            AtCommand::GetRole => writer.write_all(b"AT+ROLE?")?,
            AtCommand::SetRole(role) => {
                writer.write_all(b"AT+ROLE")?;
                writer.write_all(&[u8::from(*role)])?;
            }
            AtCommand::GetPin => writer.write_all(b"AT+PASS?")?,
            AtCommand::SetPin(pin) => {
                writer.write_all(b"AT+PASS")?;
                writer.write_all(pin.as_bytes())?;
            }
            AtCommand::GetPinCodeMode => writer.write_all(b"AT+TYPE?")?,
            AtCommand::SetPinCodeMode(mode) => {
                writer.write_all(b"AT+TYPE")?;
                writer.write_all(&[u8::from(*mode)])?;
            }
            AtCommand::GetWorkMode => writer.write_all(b"AT+MODE?")?,
            AtCommand::SetWorkMode(mode) => {
                writer.write_all(b"AT+MODE")?;
                writer.write_all(&[u8::from(*mode)])?;
            }
            AtCommand::GetWorkType => writer.write_all(b"AT+IMME?")?,
            AtCommand::SetWorkType(work_type) => {
                writer.write_all(b"AT+IMME")?;
                writer.write_all(&[u8::from(*work_type)])?;
            }
            AtCommand::SetNotify(enabled) => {
                writer.write_all(if *enabled { b"AT+NOTI1" } else { b"AT+NOTI0" })?
            }
            AtCommand::GetAddress => writer.write_all(b"AT+ADDR?")?,
            AtCommand::Connect {
                address,
                address_type,
            } => {
                writer.write_all(b"AT+CO")?;
                writer.write_all(&[u8::from(*address_type)])?;
                writer.write_all(address.to_ascii().as_bytes())?;
            }
            AtCommand::Raw(command) => writer.write_all(command.as_bytes())?,
        }

        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);

        // Writing into a Vec cannot fail
        let _ = self.to_writer(&mut buf);

        buf
    }

    /// The response shapes that complete this command
    pub fn expected(&self) -> Vec<Shape> {
        match self {
            AtCommand::Test => vec![Shape::exact(b"OK"), Shape::exact(b"OK+LOST")],
            AtCommand::Start => vec![Shape::exact(b"OK+START")],
            AtCommand::Renew => vec![Shape::exact(b"OK+RENEW")],
            AtCommand::Reset => vec![Shape::exact(b"OK+RESET")],
            AtCommand::GetName => vec![Shape::value(b"OK+NAME:", 1, MAX_NAME_LEN)],
            AtCommand::SetName(name) => vec![Shape::value(b"OK+Set:", name.len(), name.len())],
            AtCommand::GetPin => vec![Shape::value(b"OK+Get:", PIN_LEN, PIN_LEN)],
            AtCommand::SetPin(_) => vec![Shape::value(b"OK+Set:", PIN_LEN, PIN_LEN)],
            AtCommand::GetRole
            | AtCommand::GetPinCodeMode
            | AtCommand::GetWorkMode
            | AtCommand::GetWorkType => vec![Shape::value(b"OK+Get:", 1, 1)],
            AtCommand::SetRole(_)
            | AtCommand::SetPinCodeMode(_)
            | AtCommand::SetWorkMode(_)
            | AtCommand::SetWorkType(_)
            | AtCommand::SetNotify(_) => vec![Shape::value(b"OK+Set:", 1, 1)],
            AtCommand::GetAddress => vec![Shape::value(b"OK+ADDR:", 12, 12)],
            // OK+CO<type><A|E|F>
            AtCommand::Connect { .. } => vec![Shape::value(b"OK+CO", 2, 2)],
            AtCommand::Raw(_) => vec![Shape::value(b"OK", 0, MAX_RAW_REPLY_LEN)],
        }
    }

    /// The value a setter expects the module to echo back
    pub fn echoed_value(&self) -> Option<Vec<u8>> {
        match self {
            AtCommand::SetName(name) => Some(name.as_bytes().to_vec()),
            AtCommand::SetPin(pin) => Some(pin.as_bytes().to_vec()),
            AtCommand::SetRole(role) => Some(vec![u8::from(*role)]),
            AtCommand::SetPinCodeMode(mode) => Some(vec![u8::from(*mode)]),
            AtCommand::SetWorkMode(mode) => Some(vec![u8::from(*mode)]),
            AtCommand::SetWorkType(work_type) => Some(vec![u8::from(*work_type)]),
            AtCommand::SetNotify(enabled) => Some(vec![if *enabled { b'1' } else { b'0' }]),
            _ => None,
        }
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_vec()))
    }
}

/// Validates `name` for `AT+NAME`
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::InvalidValue(format!(
            "name {:?} must be 1-{} printable ASCII characters",
            name, MAX_NAME_LEN
        )));
    }

    Ok(())
}

/// Validates `pin` for `AT+PASS`
pub fn validate_pin(pin: &str) -> Result<(), Error> {
    if pin.len() != PIN_LEN || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidValue(format!("pin {:?} must be {} digits", pin, PIN_LEN)));
    }

    Ok(())
}

/// Decodes a single-character value returned by a getter
pub(crate) fn decode_choice<E: TryFromPrimitive<Primitive = u8>>(value: &[u8]) -> Result<E, Error> {
    match value {
        [byte] => E::try_from_primitive(*byte)
            .map_err(|_| Error::InvalidValue(format!("unknown setting {:?}", *byte as char))),
        _ => Err(Error::InvalidValue(format!("setting {:02x?}", value))),
    }
}
