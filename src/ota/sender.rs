use log::{debug, info, warn};

use super::packet::{Decoded, Decoder, ImageHeader, ImageKind, NackReason, OtaPacket, PacketType};
use crate::crc::crc32;
use crate::{Clock, Config, Error, Transport};

/// What came back for a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Answer {
    Ack,
    Nack(u16, NackReason),
    Silence,
}

/// The sending side of the transfer protocol.
///
/// Every packet is written and then acknowledged before the next one goes out. A packet is sent
/// again on NACK or when no answer arrives within the ACK timeout, up to the retry limit, after
/// which the transfer is aborted.
pub struct Sender<T, C> {
    transport: T,
    clock: C,
    config: Config,
    decoder: Decoder,
}

impl<T: Transport, C: Clock> Sender<T, C> {
    pub fn new(transport: T, clock: C, config: Config) -> Sender<T, C> {
        Sender {
            transport,
            clock,
            config,
            decoder: Decoder::new(config.max_payload),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Transfers `image` to the receiver as an image of the given `kind`
    pub fn send_image(&mut self, image: &[u8], kind: ImageKind, version: u32) -> Result<(), Error> {
        if image.len() > u32::MAX as usize {
            return Err(Error::InvalidValue(format!("image of {} bytes", image.len())));
        }

        let header = ImageHeader {
            size: image.len() as u32,
            crc: crc32(image),
            version,
            kind,
        };

        info!(
            "Sending {:?} image of {} bytes (crc {:#010x})",
            kind, header.size, header.crc
        );

        self.exchange(&OtaPacket::empty(PacketType::Start, 0))?;
        self.exchange(&OtaPacket::new(PacketType::Header, 0, header.to_vec()))?;

        let chunks = image.chunks(self.config.max_payload.max(1) as usize);
        let total = chunks.len();

        for (number, chunk) in chunks.enumerate() {
            if number > u16::MAX as usize {
                return Err(Error::InvalidValue(format!("image needs {} packets", total)));
            }

            self.exchange(&OtaPacket::new(PacketType::Data, number as u16, chunk.to_vec()))?;

            debug!("Sent packet {}/{}", number + 1, total);
        }

        self.exchange(&OtaPacket::empty(PacketType::End, 0))?;

        info!("Image accepted by the receiver");

        Ok(())
    }

    /// Tells the receiver to drop the transfer in progress
    pub fn abort(&mut self) -> Result<(), Error> {
        warn!("Aborting the transfer");

        self.transport
            .write(&OtaPacket::empty(PacketType::Abort, 0).to_vec()?)
    }

    fn exchange(&mut self, packet: &OtaPacket) -> Result<(), Error> {
        let frame = packet.to_vec()?;

        for attempt in 0..=self.config.retry_limit {
            if attempt > 0 {
                debug!(
                    "Resending {:?} #{} (attempt {})",
                    packet.packet_type,
                    packet.number,
                    attempt + 1
                );
            }

            self.flush()?;
            self.transport.write(&frame)?;

            match self.await_answer(packet.number)? {
                Answer::Ack => return Ok(()),
                Answer::Nack(number, reason) if is_fatal(reason) => {
                    return Err(Error::Refused { number, reason })
                }
                Answer::Nack(number, reason) => {
                    warn!("Receiver asked for #{} again ({:?})", number, reason)
                }
                Answer::Silence => {
                    warn!("No answer to {:?} #{}", packet.packet_type, packet.number)
                }
            }
        }

        self.abort()?;

        Err(Error::TransportTimeout)
    }

    fn await_answer(&mut self, number: u16) -> Result<Answer, Error> {
        let deadline = self.clock.now() + self.config.ack_timeout;

        while self.clock.now() < deadline {
            let bytes = self.transport.read_available()?;
            self.decoder.push(&bytes);

            loop {
                match self.decoder.decode_next() {
                    Decoded::Packet(reply) => match reply.packet_type {
                        PacketType::Ack if reply.number == number => return Ok(Answer::Ack),
                        PacketType::Nack => {
                            let reason = reply.nack_reason().unwrap_or(NackReason::Corrupt);
                            return Ok(Answer::Nack(reply.number, reason));
                        }
                        _ => debug!("Ignoring {:?} #{}", reply.packet_type, reply.number),
                    },
                    Decoded::Corrupt => {}
                    Decoded::Incomplete => break,
                }
            }

            std::thread::yield_now();
        }

        Ok(Answer::Silence)
    }

    /// Drops stale answers so they cannot be taken for the next packet's
    fn flush(&mut self) -> Result<(), Error> {
        self.decoder.clear();

        while !self.transport.read_available()?.is_empty() {}

        Ok(())
    }
}

/// NACK reasons after which the receiver has given up on the session
fn is_fatal(reason: NackReason) -> bool {
    matches!(
        reason,
        NackReason::CapacityExceeded
            | NackReason::ChecksumMismatch
            | NackReason::FlashWriteFailed
            | NackReason::UnknownImageKind
            | NackReason::Aborted
    )
}
