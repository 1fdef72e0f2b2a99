use std::path::PathBuf;
use std::time::Duration;

use hm10_ota::ble::{AddressType, BtAddress};
use hm10_ota::ota::ImageKind;
use hm10_ota::Config;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Wait for a peer and receive firmware images into a staging directory
    Receive(ReceiveOpts),
    /// Connect to a receiver and send it a firmware image
    Send(SendOpts),
    /// Send a raw AT command and print the reply
    At {
        /// The command, e.g. `AT+VERR?`
        #[structopt(required = true)]
        command: String,
    },
    /// Print the module's name, address and settings
    Info,
    /// Connect to a peripheral
    Connect {
        /// The peer address, e.g. `00:17:EA:09:09:09`
        #[structopt(required = true)]
        address: BtAddress,
        /// The peer address type (N, 0, 1 or 2)
        #[structopt(
            short = "t",
            long,
            default_value = "N",
            parse(try_from_str = parse_address_type)
        )]
        address_type: AddressType,
    },
    /// Restore the settings the receiver expects
    RestoreDefaults,
}

#[derive(StructOpt, Debug)]
pub struct ReceiveOpts {
    /// Directory holding one staging file per image kind
    #[structopt(short = "d", long, default_value = "staging")]
    pub dir: PathBuf,
    /// Capacity of each staging region in bytes
    #[structopt(long, default_value = "262144")]
    pub capacity: u32,
    /// Exit after the first committed image
    #[structopt(long)]
    pub once: bool,
}

#[derive(StructOpt, Debug)]
pub struct SendOpts {
    /// Address of the receiving module
    #[structopt(required = true)]
    pub address: BtAddress,
    /// The image to send
    #[structopt(required = true)]
    pub filename: PathBuf,
    /// The peer address type (N, 0, 1 or 2)
    #[structopt(
        short = "t",
        long,
        default_value = "N",
        parse(try_from_str = parse_address_type)
    )]
    pub address_type: AddressType,
    /// The kind of image (application, bootloader or custom-data)
    #[structopt(
        short = "k",
        long,
        default_value = "application",
        parse(try_from_str = parse_image_kind)
    )]
    pub kind: ImageKind,
    /// Version number announced in the image header
    #[structopt(long, default_value = "0")]
    pub version: u32,
}

#[derive(StructOpt, Debug)]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The serial device to connect to
    #[structopt(
        env = "SERIAL_PORT",
        short = "p",
        long = "port",
        default_value = "/dev/ttyUSB0"
    )]
    pub serial_port: String,
    /// The serial baud rate of the HM-10
    #[structopt(
        env = "BAUD_RATE",
        short = "b",
        long = "baud-rate",
        default_value = "9600"
    )]
    pub baud_rate: u32,
    /// Log at debug level unless RUST_LOG says otherwise
    #[structopt(short = "v", long)]
    pub verbose: bool,

    /// Largest packet payload in bytes
    #[structopt(env = "OTA_MAX_PAYLOAD", long, default_value = "1024")]
    pub max_payload: u16,
    /// Milliseconds to wait for the next packet before re-requesting it
    #[structopt(env = "OTA_PACKET_TIMEOUT", long, default_value = "3000")]
    pub packet_timeout: u64,
    /// Timeouts tolerated per step before a transfer is aborted
    #[structopt(env = "OTA_RETRY_LIMIT", long, default_value = "5")]
    pub retry_limit: u8,
    /// Milliseconds to wait for an AT response
    #[structopt(env = "AT_TIMEOUT", long, default_value = "800")]
    pub at_timeout: u64,
    /// Milliseconds of silence that complete an open-ended AT response
    #[structopt(env = "AT_QUIET_GAP", long, default_value = "60")]
    pub at_quiet_gap: u64,
    /// Milliseconds to wait for a connection to be confirmed
    #[structopt(env = "CONNECT_TIMEOUT", long, default_value = "10000")]
    pub connect_timeout: u64,
    /// Milliseconds the sender waits for an acknowledgement
    #[structopt(env = "OTA_ACK_TIMEOUT", long, default_value = "2000")]
    pub ack_timeout: u64,
}

impl Opts {
    pub fn config(&self) -> Config {
        Config {
            max_payload: self.max_payload,
            packet_timeout: Duration::from_millis(self.packet_timeout),
            retry_limit: self.retry_limit,
            at_timeout: Duration::from_millis(self.at_timeout),
            at_quiet_gap: Duration::from_millis(self.at_quiet_gap),
            connect_timeout: Duration::from_millis(self.connect_timeout),
            ack_timeout: Duration::from_millis(self.ack_timeout),
        }
    }
}

fn parse_address_type(s: &str) -> Result<AddressType, String> {
    match s {
        "N" | "n" => Ok(AddressType::Normal),
        "0" => Ok(AddressType::StaticMac),
        "1" => Ok(AddressType::StaticRandomMac),
        "2" => Ok(AddressType::RandomMac),
        _ => Err(format!("unknown address type {:?}", s)),
    }
}

fn parse_image_kind(s: &str) -> Result<ImageKind, String> {
    match s {
        "application" | "app" => Ok(ImageKind::Application),
        "bootloader" => Ok(ImageKind::Bootloader),
        "custom-data" | "data" => Ok(ImageKind::CustomData),
        _ => Err(format!("unknown image kind {:?}", s)),
    }
}
