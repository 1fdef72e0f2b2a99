use std::convert::TryFrom;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::crc::crc16;
use crate::{Error, SessionError};

/// Length of the type, number and length fields that precede the payload
pub const FRAME_HEADER_LEN: usize = 5;
/// Length of the trailing frame checksum
pub const FRAME_CRC_LEN: usize = 2;
/// Length of a HEADER packet's payload
pub const IMAGE_HEADER_LEN: usize = 16;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum PacketType {
    Start = 0x01,
    Header = 0x02,
    Data = 0x03,
    End = 0x04,
    Abort = 0x05,
    Ack = 0x06,
    Nack = 0x07,
}

/// Why a packet was refused, carried as the single payload byte of a NACK
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum NackReason {
    Corrupt = 1,
    OutOfSequence = 2,
    Timeout = 3,
    CapacityExceeded = 4,
    ChecksumMismatch = 5,
    LengthMismatch = 6,
    FlashWriteFailed = 7,
    UnexpectedPacket = 8,
    UnknownImageKind = 9,
    Aborted = 10,
}

/// The staging region an image is destined for
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum ImageKind {
    Application = 0,
    Bootloader = 1,
    CustomData = 2,
}

/// One frame of the transfer protocol.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OtaPacket {
    pub packet_type: PacketType,
    pub number: u16,
    pub payload: Vec<u8>,
}

impl OtaPacket {
    pub fn new(packet_type: PacketType, number: u16, payload: Vec<u8>) -> OtaPacket {
        OtaPacket {
            packet_type,
            number,
            payload,
        }
    }

    /// A packet without payload
    pub fn empty(packet_type: PacketType, number: u16) -> OtaPacket {
        OtaPacket::new(packet_type, number, Vec::new())
    }

    pub fn ack(number: u16) -> OtaPacket {
        OtaPacket::empty(PacketType::Ack, number)
    }

    pub fn nack(number: u16, reason: NackReason) -> OtaPacket {
        OtaPacket::new(PacketType::Nack, number, vec![reason.into()])
    }

    /// The reason carried by a NACK, if this is a well-formed one
    pub fn nack_reason(&self) -> Option<NackReason> {
        match (self.packet_type, self.payload.as_slice()) {
            (PacketType::Nack, [reason]) => NackReason::try_from(*reason).ok(),
            _ => None,
        }
    }

    /// Serializes the frame, checksum included
    pub fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        writer.write_all(&self.to_vec()?)?;

        Ok(())
    }

    /// Builds the frame, or fails if the payload does not fit the 16-bit length field
    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let payload_length = u16::try_from(self.payload.len()).map_err(|_| {
            Error::InvalidValue(format!("payload of {} bytes", self.payload.len()))
        })?;

        Ok(frame(self.packet_type, self.number, payload_length, &self.payload))
    }
}

fn frame(packet_type: PacketType, number: u16, payload_length: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_CRC_LEN);

    frame.push(packet_type.into());
    frame.extend_from_slice(&number.to_le_bytes());
    frame.extend_from_slice(&payload_length.to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());

    frame
}

/// Encodes the acknowledgement of `number`
pub fn encode_ack(number: u16) -> Vec<u8> {
    frame(PacketType::Ack, number, 0, &[])
}

/// Encodes the refusal of, or re-request for, `number`
pub fn encode_nack(number: u16, reason: NackReason) -> Vec<u8> {
    frame(PacketType::Nack, number, 1, &[reason.into()])
}

/// An acknowledgement the receiving side sends back to the peer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reply {
    Ack(u16),
    Nack(u16, NackReason),
}

impl Reply {
    pub fn to_packet(&self) -> OtaPacket {
        match *self {
            Reply::Ack(number) => OtaPacket::ack(number),
            Reply::Nack(number, reason) => OtaPacket::nack(number, reason),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match *self {
            Reply::Ack(number) => encode_ack(number),
            Reply::Nack(number, reason) => encode_nack(number, reason),
        }
    }
}

/// Metadata carried by the HEADER packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageHeader {
    /// Total image size in bytes
    pub size: u32,
    /// CRC-32/MPEG-2 over the whole image
    pub crc: u32,
    pub version: u32,
    pub kind: ImageKind,
}

impl ImageHeader {
    pub fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        writer.write_all(&self.to_vec())?;

        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IMAGE_HEADER_LEN);

        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.crc.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        // Reserved
        buf.extend_from_slice(&[0, 0, 0]);
        buf.push(self.kind.into());

        buf
    }

    pub fn from_reader<R: Read + ReadBytesExt>(mut reader: R) -> Result<ImageHeader, Error> {
        let size = reader.read_u32::<LittleEndian>()?;
        let crc = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;

        // Skip the reserved fields
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;

        let kind = reader.read_u8()?;
        let kind = ImageKind::try_from(kind)
            .map_err(|_| Error::Session(SessionError::UnknownImageKind(kind)))?;

        Ok(ImageHeader {
            size,
            crc,
            version,
            kind,
        })
    }

    /// Parses the payload of a HEADER packet, which must be exactly `IMAGE_HEADER_LEN` bytes
    pub fn from_payload(payload: &[u8]) -> Result<ImageHeader, Error> {
        if payload.len() != IMAGE_HEADER_LEN {
            return Err(Error::InvalidValue(format!(
                "image header of {} bytes",
                payload.len()
            )));
        }

        ImageHeader::from_reader(Cursor::new(payload))
    }
}

/// The result of trying to take one frame off the front of the buffered stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Decoded {
    Packet(OtaPacket),
    /// More bytes are needed
    Incomplete,
    /// A frame failed validation and was discarded
    Corrupt,
}

/// Reassembles frames from bytes that arrive in arbitrary chunks.
#[derive(Debug, Clone)]
pub struct Decoder {
    buf: Vec<u8>,
    max_payload: u16,
}

impl Decoder {
    pub fn new(max_payload: u16) -> Decoder {
        Decoder {
            buf: Vec::new(),
            max_payload,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting to be decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Decodes the next frame from the buffered bytes.
    ///
    /// The length field is checked against the maximum payload before waiting for the payload,
    /// so an absurd length is reported as `Corrupt` right away instead of stalling the stream.
    pub fn decode_next(&mut self) -> Decoded {
        self.skip_to_frame_start();

        if self.buf.len() < FRAME_HEADER_LEN {
            return Decoded::Incomplete;
        }

        let mut cursor = Cursor::new(&self.buf[..FRAME_HEADER_LEN]);
        let (packet_type, number, payload_length) = match (
            cursor.read_u8(),
            cursor.read_u16::<LittleEndian>(),
            cursor.read_u16::<LittleEndian>(),
        ) {
            (Ok(packet_type), Ok(number), Ok(payload_length)) => {
                (packet_type, number, payload_length)
            }
            _ => return Decoded::Incomplete,
        };

        if payload_length > self.max_payload {
            warn!(
                "Discarding frame with payload length {} (max {})",
                payload_length, self.max_payload
            );

            self.resync();

            return Decoded::Corrupt;
        }

        let payload_end = FRAME_HEADER_LEN + payload_length as usize;
        let frame_len = payload_end + FRAME_CRC_LEN;

        if self.buf.len() < frame_len {
            return Decoded::Incomplete;
        }

        let received = u16::from_le_bytes([self.buf[payload_end], self.buf[payload_end + 1]]);
        let calculated = crc16(&self.buf[..payload_end]);

        if received != calculated {
            warn!(
                "Discarding frame with bad checksum (received {:#06x}, calculated {:#06x})",
                received, calculated
            );

            self.resync();

            return Decoded::Corrupt;
        }

        let packet_type = match PacketType::try_from(packet_type) {
            Ok(packet_type) => packet_type,
            Err(_) => {
                self.resync();
                return Decoded::Corrupt;
            }
        };

        let payload = self.buf[FRAME_HEADER_LEN..payload_end].to_vec();
        self.buf.drain(..frame_len);

        trace!("Decoded {:?} #{} ({} bytes)", packet_type, number, payload.len());

        Decoded::Packet(OtaPacket::new(packet_type, number, payload))
    }

    /// Drops the head of a bad frame and scans forward for the next plausible start
    fn resync(&mut self) {
        if !self.buf.is_empty() {
            self.buf.remove(0);
        }

        self.skip_to_frame_start();
    }

    fn skip_to_frame_start(&mut self) {
        let start = self
            .buf
            .iter()
            .position(|byte| PacketType::try_from(*byte).is_ok())
            .unwrap_or_else(|| self.buf.len());

        if start > 0 {
            trace!("Skipping {} bytes of noise", start);
            self.buf.drain(..start);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::*;
    use hex_literal::hex;

    use super::*;

    const DATA_FRAME: [u8; 11] = hex!("03 00 00 04 00 de ad be ef c0 f7");

    #[test]
    fn it_should_serialize_acknowledgements() {
        assert_eq_hex!(encode_ack(3), hex!("06 03 00 00 00 55 47").to_vec());
        assert_eq_hex!(
            encode_nack(2, NackReason::OutOfSequence),
            hex!("07 02 00 01 00 02 a0 95").to_vec()
        );
    }

    #[test]
    fn it_should_serialize_a_data_packet() {
        let packet = OtaPacket::new(PacketType::Data, 0, hex!("de ad be ef").to_vec());

        assert_eq_hex!(packet.to_vec().unwrap(), DATA_FRAME.to_vec());
    }

    #[test]
    fn it_should_refuse_to_serialize_an_oversized_payload() {
        let packet = OtaPacket::new(PacketType::Data, 0, vec![0; u16::MAX as usize + 1]);
        let mut buf = Vec::new();

        assert!(matches!(packet.to_vec(), Err(Error::InvalidValue(_))));
        assert!(packet.to_writer(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn it_should_deserialize_an_image_header() {
        let input = hex!("64 00 00 00 78 56 34 12 02 00 00 00 00 00 00 01");
        let header = ImageHeader::from_payload(&input).unwrap();

        assert_eq!(header.size, 100);
        assert_eq_hex!(header.crc, 0x1234_5678);
        assert_eq!(header.version, 2);
        assert_eq!(header.kind, ImageKind::Bootloader);
        assert_eq_hex!(header.to_vec(), input.to_vec());
    }

    #[test]
    fn it_should_refuse_unknown_image_kinds() {
        let input = hex!("64 00 00 00 78 56 34 12 02 00 00 00 00 00 00 09");

        assert!(matches!(
            ImageHeader::from_payload(&input),
            Err(Error::Session(SessionError::UnknownImageKind(9)))
        ));
        assert!(ImageHeader::from_payload(&input[..15]).is_err());
    }

    #[test]
    fn it_should_reassemble_fragmented_frames() {
        let mut decoder = Decoder::new(1024);

        decoder.push(&DATA_FRAME[..3]);
        assert_eq!(decoder.decode_next(), Decoded::Incomplete);

        decoder.push(&DATA_FRAME[3..8]);
        assert_eq!(decoder.decode_next(), Decoded::Incomplete);

        decoder.push(&DATA_FRAME[8..]);
        assert_eq!(
            decoder.decode_next(),
            Decoded::Packet(OtaPacket::new(
                PacketType::Data,
                0,
                hex!("de ad be ef").to_vec()
            ))
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn it_should_report_any_single_bit_flip_as_corrupt() {
        for bit in 0..32 {
            let mut frame = DATA_FRAME;
            frame[FRAME_HEADER_LEN + bit / 8] ^= 1 << (bit % 8);

            let mut decoder = Decoder::new(1024);
            decoder.push(&frame);

            assert_eq!(decoder.decode_next(), Decoded::Corrupt, "bit {}", bit);
        }
    }

    #[test]
    fn it_should_resynchronize_after_a_corrupt_frame() {
        let mut corrupted = DATA_FRAME;
        corrupted[6] ^= 0x10;

        let mut decoder = Decoder::new(1024);
        decoder.push(&corrupted);
        decoder.push(&hex!("01 00 00 00 00 5d bb"));

        let mut packets = Vec::new();

        for _ in 0..16 {
            match decoder.decode_next() {
                Decoded::Packet(packet) => packets.push(packet),
                Decoded::Corrupt => continue,
                Decoded::Incomplete => break,
            }
        }

        assert_eq!(packets.last(), Some(&OtaPacket::empty(PacketType::Start, 0)));
    }

    #[test]
    fn it_should_reject_oversized_lengths_before_reading_the_payload() {
        let mut decoder = Decoder::new(16);
        decoder.push(&hex!("03 00 00 00 04"));

        assert_eq!(decoder.decode_next(), Decoded::Corrupt);
    }

    #[test]
    fn it_should_skip_leading_noise() {
        let mut decoder = Decoder::new(1024);
        decoder.push(&hex!("ff 00 aa"));
        decoder.push(&hex!("04 00 00 00 00 0a 98"));

        assert_eq!(
            decoder.decode_next(),
            Decoded::Packet(OtaPacket::empty(PacketType::End, 0))
        );
    }

    #[test]
    fn it_should_extract_nack_reasons() {
        assert_eq!(
            OtaPacket::nack(4, NackReason::Timeout).nack_reason(),
            Some(NackReason::Timeout)
        );
        assert_eq!(OtaPacket::ack(4).nack_reason(), None);
    }
}
