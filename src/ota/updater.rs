use log::{debug, info, warn};

use super::packet::{Decoded, Decoder, ImageKind, OtaPacket, PacketType, Reply};
use super::session::{Event, OtaEngine, OtaState};
use super::staging::FlashStaging;
use crate::ble::Hm10;
use crate::{Clock, Config, Error, SessionError, Transport};

/// How an update session ended
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionOutcome {
    Committed { kind: ImageKind, size: u32, crc: u32 },
    Aborted(SessionError),
}

/// The control loop of the receiving side.
///
/// Every iteration drains the BLE driver, reassembles packets, and feeds them to the engine
/// followed by a tick, so step deadlines are checked even when nothing arrives. Link loss and
/// ABORT packets are handled before anything else that arrived in the same iteration.
pub struct Updater<T, C, F> {
    ble: Hm10<T, C>,
    engine: OtaEngine<F>,
    decoder: Decoder,
}

impl<T: Transport, C: Clock, F: FlashStaging> Updater<T, C, F> {
    pub fn new(ble: Hm10<T, C>, staging: F, config: Config) -> Updater<T, C, F> {
        Updater {
            ble,
            engine: OtaEngine::new(staging, config),
            decoder: Decoder::new(config.max_payload),
        }
    }

    pub fn ble(&self) -> &Hm10<T, C> {
        &self.ble
    }

    pub fn ble_mut(&mut self) -> &mut Hm10<T, C> {
        &mut self.ble
    }

    pub fn engine(&self) -> &OtaEngine<F> {
        &self.engine
    }

    pub fn into_parts(self) -> (Hm10<T, C>, OtaEngine<F>) {
        (self.ble, self.engine)
    }

    /// Runs the loop until a session ends
    pub fn run(&mut self) -> Result<SessionOutcome, Error> {
        loop {
            if let Some(outcome) = self.poll()? {
                return Ok(outcome);
            }

            std::thread::yield_now();
        }
    }

    /// Runs a single iteration of the loop.
    ///
    /// Returns the outcome once a session has ended, at which point the engine is back in `Idle`
    /// and ready for the next one.
    pub fn poll(&mut self) -> Result<Option<SessionOutcome>, Error> {
        let bytes = self.ble.read_data()?;
        let now = self.ble.clock().now();

        if self.ble.transport_lost() && self.engine.state().is_active() {
            self.decoder.clear();
            self.engine.handle(now, Event::LinkLost);

            return Ok(self.finish());
        }

        self.decoder.push(&bytes);

        let mut packets = Vec::new();

        loop {
            match self.decoder.decode_next() {
                Decoded::Packet(packet) => packets.push(packet),
                Decoded::Corrupt => warn!("Dropped a corrupt frame"),
                Decoded::Incomplete => break,
            }
        }

        if let Some(abort) = take_abort(&mut packets) {
            packets = vec![abort];
        }

        for packet in packets {
            if let Some(reply) = self.engine.handle(now, Event::Packet(packet)) {
                self.send(reply)?;
            }

            if let Some(outcome) = self.finish() {
                return Ok(Some(outcome));
            }
        }

        if let Some(reply) = self.engine.handle(now, Event::Tick) {
            self.send(reply)?;
        }

        Ok(self.finish())
    }

    fn send(&mut self, reply: Reply) -> Result<(), Error> {
        if !self.ble.transport_ready() {
            debug!("Dropping {:?}, the link is down", reply);
            return Ok(());
        }

        debug!("Replying {:?}", reply);

        self.ble.write_data(&reply.to_vec())
    }

    /// Collects the outcome of a session that has ended and returns the engine to `Idle`
    fn finish(&mut self) -> Option<SessionOutcome> {
        let outcome = match self.engine.state() {
            OtaState::Committed => {
                let header = self.engine.session().header?;

                SessionOutcome::Committed {
                    kind: header.kind,
                    size: header.size,
                    crc: header.crc,
                }
            }
            OtaState::Aborted => SessionOutcome::Aborted(
                self.engine
                    .status()
                    .last_error
                    .unwrap_or(SessionError::AbortedByPeer),
            ),
            _ => return None,
        };

        info!("Session finished: {:?}", outcome);

        self.engine.reset();
        self.decoder.clear();

        Some(outcome)
    }
}

/// Removes and returns the first ABORT packet, if any
fn take_abort(packets: &mut Vec<OtaPacket>) -> Option<OtaPacket> {
    let position = packets
        .iter()
        .position(|packet| packet.packet_type == PacketType::Abort)?;

    Some(packets.remove(position))
}
