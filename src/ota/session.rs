use std::time::Duration;

use log::{debug, error, info, warn};

use super::packet::{ImageHeader, ImageKind, NackReason, OtaPacket, PacketType, Reply};
use super::staging::FlashStaging;
use crate::crc::Crc32;
use crate::{Config, Error, SessionError};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OtaState {
    Idle,
    AwaitingHeader,
    ReceivingData,
    VerifyingImage,
    Committed,
    Aborted,
}

impl OtaState {
    /// Returns `true` while a transfer is in progress
    pub fn is_active(self) -> bool {
        matches!(
            self,
            OtaState::AwaitingHeader | OtaState::ReceivingData | OtaState::VerifyingImage
        )
    }
}

/// Mutable state of one update session.
#[derive(Debug, Clone)]
pub struct OtaSession {
    pub state: OtaState,
    pub header: Option<ImageHeader>,
    /// Number of the next DATA packet to accept
    pub expected: u16,
    pub bytes_written: u32,
    /// Running whole-image checksum over the accepted payloads
    pub crc: Crc32,
    /// Timeouts in the current step
    pub retries: u8,
    pub deadline: Option<Duration>,
    /// Whether the staging region has been erased for this session
    pub erased: bool,
    pub last_error: Option<SessionError>,
}

impl Default for OtaSession {
    fn default() -> OtaSession {
        OtaSession {
            state: OtaState::Idle,
            header: None,
            expected: 0,
            bytes_written: 0,
            crc: Crc32::new(),
            retries: 0,
            deadline: None,
            erased: false,
            last_error: None,
        }
    }
}

/// Something the engine reacts to
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// A validated packet from the peer
    Packet(OtaPacket),
    /// Time has passed without a packet
    Tick,
    /// The BLE link went down
    LinkLost,
}

/// A snapshot of the session for display
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SessionStatus {
    pub state: OtaState,
    pub image_kind: Option<ImageKind>,
    pub bytes_written: u32,
    pub declared_size: Option<u32>,
    pub last_error: Option<SessionError>,
}

/// The receiving side of the transfer protocol.
///
/// The engine is driven by `handle` and answers each event with at most one reply for the peer.
/// It never touches the transport itself; flash effects go through the `FlashStaging` it owns.
pub struct OtaEngine<F> {
    staging: F,
    config: Config,
    session: OtaSession,
    /// The image committed by the previous session, until another one starts
    last_committed: Option<ImageHeader>,
}

impl<F: FlashStaging> OtaEngine<F> {
    pub fn new(staging: F, config: Config) -> OtaEngine<F> {
        OtaEngine {
            staging,
            config,
            session: OtaSession::default(),
            last_committed: None,
        }
    }

    pub fn state(&self) -> OtaState {
        self.session.state
    }

    pub fn session(&self) -> &OtaSession {
        &self.session
    }

    pub fn staging(&self) -> &F {
        &self.staging
    }

    pub fn staging_mut(&mut self) -> &mut F {
        &mut self.staging
    }

    pub fn into_staging(self) -> F {
        self.staging
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.session.state,
            image_kind: self.session.header.map(|header| header.kind),
            bytes_written: self.session.bytes_written,
            declared_size: self.session.header.map(|header| header.size),
            last_error: self.session.last_error,
        }
    }

    /// Returns a finished session to `Idle`.
    ///
    /// A transfer that is still in progress is discarded along with its staged bytes. A committed
    /// image is remembered so that a resent END can still be acknowledged.
    pub fn reset(&mut self) {
        if self.session.state.is_active() {
            warn!("Discarding the update in progress");
            self.invalidate();
        }

        self.last_committed = match self.session.state {
            OtaState::Committed => self.session.header,
            _ => None,
        };

        debug!("Session {:?} -> Idle", self.session.state);

        self.session = OtaSession::default();
    }

    /// Advances the session by one event, returning the reply to send to the peer, if any
    pub fn handle(&mut self, now: Duration, event: Event) -> Option<Reply> {
        match event {
            Event::LinkLost => {
                if self.session.state.is_active() {
                    self.abort(SessionError::ConnectionLost);
                }

                None
            }
            Event::Tick => self.check_deadline(now),
            Event::Packet(packet) => self.on_packet(now, packet),
        }
    }

    fn on_packet(&mut self, now: Duration, packet: OtaPacket) -> Option<Reply> {
        debug!(
            "{:?}: {:?} #{} ({} bytes)",
            self.session.state,
            packet.packet_type,
            packet.number,
            packet.payload.len()
        );

        if packet.packet_type == PacketType::Abort {
            match self.session.state {
                OtaState::Committed | OtaState::Aborted => {}
                _ => self.abort(SessionError::AbortedByPeer),
            }

            return Some(Reply::Ack(packet.number));
        }

        match (self.session.state, packet.packet_type) {
            (OtaState::Idle, PacketType::Start) => {
                self.start(now);
                Some(Reply::Ack(packet.number))
            }
            // The final ACK got lost after the session was collected
            (OtaState::Idle, PacketType::End) if self.last_committed.is_some() => {
                debug!("Re-acknowledging END of the committed image");
                Some(Reply::Ack(packet.number))
            }
            (OtaState::Idle, _) => None,

            // Our ACK got lost
            (OtaState::AwaitingHeader, PacketType::Start) => Some(Reply::Ack(packet.number)),
            (OtaState::AwaitingHeader, PacketType::Header) => self.on_header(now, &packet),

            (OtaState::ReceivingData, PacketType::Data) => self.on_data(now, &packet),
            (OtaState::ReceivingData, PacketType::End) => self.on_end(&packet),
            (OtaState::ReceivingData, PacketType::Header) => {
                let repeated = ImageHeader::from_payload(&packet.payload).ok();

                if repeated.is_some()
                    && repeated == self.session.header
                    && self.session.bytes_written == 0
                {
                    Some(Reply::Ack(packet.number))
                } else {
                    Some(Reply::Nack(packet.number, NackReason::UnexpectedPacket))
                }
            }

            // The final ACK got lost
            (OtaState::Committed, PacketType::End) => Some(Reply::Ack(packet.number)),
            (OtaState::Committed, _) | (OtaState::Aborted, _) => None,

            (_, PacketType::Ack) | (_, PacketType::Nack) => None,
            (_, _) => {
                warn!(
                    "Refusing {:?} while {:?}",
                    packet.packet_type, self.session.state
                );

                Some(Reply::Nack(packet.number, NackReason::UnexpectedPacket))
            }
        }
    }

    fn start(&mut self, now: Duration) {
        info!("Update session started");

        self.last_committed = None;
        self.session = OtaSession {
            state: OtaState::AwaitingHeader,
            deadline: Some(now + self.config.packet_timeout),
            ..OtaSession::default()
        };
    }

    fn on_header(&mut self, now: Duration, packet: &OtaPacket) -> Option<Reply> {
        let header = match ImageHeader::from_payload(&packet.payload) {
            Ok(header) => header,
            Err(Error::Session(err @ SessionError::UnknownImageKind(_))) => {
                self.abort(err);
                return Some(Reply::Nack(packet.number, NackReason::UnknownImageKind));
            }
            Err(err) => {
                warn!("Refusing malformed header: {}", err);
                return Some(Reply::Nack(packet.number, NackReason::LengthMismatch));
            }
        };

        let capacity = self.staging.capacity(header.kind);

        if header.size > capacity {
            self.abort(SessionError::CapacityExceeded {
                declared: header.size,
                capacity,
            });

            return Some(Reply::Nack(packet.number, NackReason::CapacityExceeded));
        }

        self.session.header = Some(header);

        if let Err(err) = self.staging.erase_region(header.kind) {
            error!("Could not erase the {:?} region: {}", header.kind, err);

            self.abort(SessionError::FlashWriteFailed);

            return Some(Reply::Nack(packet.number, NackReason::FlashWriteFailed));
        }

        info!(
            "Receiving {:?} image of {} bytes (version {}, crc {:#010x})",
            header.kind, header.size, header.version, header.crc
        );

        self.session.erased = true;
        self.session.state = OtaState::ReceivingData;
        self.progress(now);

        Some(Reply::Ack(packet.number))
    }

    fn on_data(&mut self, now: Duration, packet: &OtaPacket) -> Option<Reply> {
        let header = self.session.header?;
        let expected = self.session.expected;

        if packet.number < expected {
            debug!("Re-acknowledging duplicate #{}", packet.number);
            return Some(Reply::Ack(packet.number));
        }

        if packet.number > expected {
            warn!("Out of sequence #{} (expected #{})", packet.number, expected);

            return Some(match expected.checked_sub(1) {
                Some(last) => Reply::Ack(last),
                None => Reply::Nack(expected, NackReason::OutOfSequence),
            });
        }

        let offset = self.session.bytes_written;

        if offset as u64 + packet.payload.len() as u64 > header.size as u64 {
            warn!(
                "#{} would overrun the declared size of {} bytes",
                packet.number, header.size
            );

            return Some(Reply::Nack(packet.number, NackReason::LengthMismatch));
        }

        if let Err(err) = self.staging.program(header.kind, offset, &packet.payload) {
            error!("Could not program {} bytes at {}: {}", packet.payload.len(), offset, err);

            self.abort(SessionError::FlashWriteFailed);

            return Some(Reply::Nack(packet.number, NackReason::FlashWriteFailed));
        }

        self.session.crc.update(&packet.payload);
        self.session.bytes_written += packet.payload.len() as u32;
        self.session.expected = expected.wrapping_add(1);
        self.progress(now);

        Some(Reply::Ack(packet.number))
    }

    fn on_end(&mut self, packet: &OtaPacket) -> Option<Reply> {
        let header = self.session.header?;
        let received = self.session.bytes_written;

        if received != header.size {
            self.abort(SessionError::LengthMismatch {
                declared: header.size,
                received,
            });

            return Some(Reply::Nack(packet.number, NackReason::LengthMismatch));
        }

        self.session.state = OtaState::VerifyingImage;
        self.session.deadline = None;

        let actual = self.session.crc.finish();

        if actual != header.crc {
            self.abort(SessionError::ChecksumMismatch {
                expected: header.crc,
                actual,
            });

            return Some(Reply::Nack(packet.number, NackReason::ChecksumMismatch));
        }

        if let Err(err) = self.staging.finalize(header.kind) {
            error!("Could not finalize the {:?} region: {}", header.kind, err);

            self.abort(SessionError::FlashWriteFailed);

            return Some(Reply::Nack(packet.number, NackReason::FlashWriteFailed));
        }

        info!(
            "{:?} image of {} bytes committed (crc {:#010x})",
            header.kind, header.size, actual
        );

        self.session.state = OtaState::Committed;

        Some(Reply::Ack(packet.number))
    }

    fn check_deadline(&mut self, now: Duration) -> Option<Reply> {
        let deadline = self.session.deadline?;

        if now < deadline {
            return None;
        }

        let number = match self.session.state {
            OtaState::AwaitingHeader => 0,
            OtaState::ReceivingData => self.session.expected,
            _ => return None,
        };

        self.session.retries += 1;

        if self.session.retries > self.config.retry_limit {
            self.abort(SessionError::TransportTimeout);

            return Some(Reply::Nack(number, NackReason::Aborted));
        }

        warn!(
            "Timed out in {:?}, re-requesting #{} ({}/{})",
            self.session.state, number, self.session.retries, self.config.retry_limit
        );

        self.session.deadline = Some(now + self.config.packet_timeout);

        Some(Reply::Nack(number, NackReason::Timeout))
    }

    /// Resets the step deadline and retry counter after the session moved forward
    fn progress(&mut self, now: Duration) {
        self.session.retries = 0;
        self.session.deadline = Some(now + self.config.packet_timeout);
    }

    fn abort(&mut self, reason: SessionError) {
        error!("Update aborted: {}", reason);

        self.invalidate();

        self.session.state = OtaState::Aborted;
        self.session.deadline = None;
        self.session.last_error = Some(reason);
    }

    fn invalidate(&mut self) {
        if !self.session.erased {
            return;
        }

        self.session.erased = false;

        if let Some(header) = self.session.header {
            if let Err(err) = self.staging.invalidate(header.kind) {
                error!("Could not invalidate the {:?} region: {}", header.kind, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc32;
    use crate::ota::staging::{FlashCall, MemoryStaging};

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn image() -> Vec<u8> {
        (0..100u32).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn engine(capacity: u32) -> OtaEngine<MemoryStaging> {
        OtaEngine::new(MemoryStaging::new(capacity), Config::default())
    }

    fn header(size: u32, crc: u32, kind: ImageKind) -> OtaPacket {
        let header = ImageHeader {
            size,
            crc,
            version: 1,
            kind,
        };

        OtaPacket::new(PacketType::Header, 0, header.to_vec())
    }

    fn data(number: u16, payload: &[u8]) -> Event {
        Event::Packet(OtaPacket::new(PacketType::Data, number, payload.to_vec()))
    }

    fn packet(packet_type: PacketType) -> Event {
        Event::Packet(OtaPacket::empty(packet_type, 0))
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// Drives an engine through START and HEADER for `image`
    fn receiving(image: &[u8], capacity: u32) -> OtaEngine<MemoryStaging> {
        let mut engine = engine(capacity);
        let header = header(image.len() as u32, crc32(image), ImageKind::Application);

        assert_eq!(engine.handle(secs(0), packet(PacketType::Start)), Some(Reply::Ack(0)));
        assert_eq!(engine.handle(secs(0), Event::Packet(header)), Some(Reply::Ack(0)));
        assert_eq!(engine.state(), OtaState::ReceivingData);

        engine
    }

    #[test]
    fn it_should_commit_an_image_delivered_in_order() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        for (number, chunk) in image.chunks(20).enumerate() {
            assert_eq!(
                engine.handle(secs(1), data(number as u16, chunk)),
                Some(Reply::Ack(number as u16))
            );
        }

        assert_eq!(engine.handle(secs(1), packet(PacketType::End)), Some(Reply::Ack(0)));
        assert_eq!(engine.state(), OtaState::Committed);

        let staging = engine.staging();

        assert_eq!(staging.image(ImageKind::Application), image.as_slice());
        assert_eq!(staging.finalize_count(), 1);
        assert!(staging.is_valid(ImageKind::Application));
        assert!(staging.calls().iter().all(|call| match call {
            FlashCall::Program { offset, len, .. } => *offset as usize + len <= 100,
            _ => true,
        }));
    }

    #[test]
    fn it_should_abort_before_writing_when_the_image_exceeds_capacity() {
        let mut engine = engine(64);

        engine.handle(secs(0), packet(PacketType::Start));

        assert_eq!(
            engine.handle(secs(0), Event::Packet(header(100, 0, ImageKind::Application))),
            Some(Reply::Nack(0, NackReason::CapacityExceeded))
        );
        assert_eq!(engine.state(), OtaState::Aborted);
        assert_eq!(
            engine.status().last_error,
            Some(SessionError::CapacityExceeded {
                declared: 100,
                capacity: 64
            })
        );
        assert!(engine.staging().calls().is_empty());
    }

    #[test]
    fn it_should_acknowledge_duplicates_without_rewriting() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        assert_eq!(engine.handle(secs(1), data(0, &image[..20])), Some(Reply::Ack(0)));
        assert_eq!(engine.handle(secs(1), data(1, &image[20..40])), Some(Reply::Ack(1)));

        let staged = engine.staging().image(ImageKind::Application).to_vec();

        assert_eq!(engine.handle(secs(1), data(1, &image[20..40])), Some(Reply::Ack(1)));
        assert_eq!(engine.handle(secs(1), data(0, &[0u8; 20])), Some(Reply::Ack(0)));
        assert_eq!(engine.staging().image(ImageKind::Application), staged.as_slice());
        assert_eq!(engine.staging().program_count(), 2);
        assert_eq!(engine.session().expected, 2);
    }

    #[test]
    fn it_should_repeat_the_last_ack_for_packets_from_the_future() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        assert_eq!(
            engine.handle(secs(1), data(2, &image[40..60])),
            Some(Reply::Nack(0, NackReason::OutOfSequence))
        );
        assert_eq!(engine.handle(secs(1), data(0, &image[..20])), Some(Reply::Ack(0)));
        assert_eq!(engine.handle(secs(1), data(3, &image[60..80])), Some(Reply::Ack(0)));
        assert_eq!(engine.staging().program_count(), 1);
    }

    #[test]
    fn it_should_never_finalize_a_tampered_image() {
        let image = image();
        let mut engine = receiving(&image, 1024);
        let mut tampered = image.clone();
        tampered[42] ^= 0x01;

        for (number, chunk) in tampered.chunks(20).enumerate() {
            engine.handle(secs(1), data(number as u16, chunk));
        }

        assert_eq!(
            engine.handle(secs(1), packet(PacketType::End)),
            Some(Reply::Nack(0, NackReason::ChecksumMismatch))
        );
        assert_eq!(engine.state(), OtaState::Aborted);
        assert!(matches!(
            engine.status().last_error,
            Some(SessionError::ChecksumMismatch { .. })
        ));

        let staging = engine.staging();

        assert_eq!(staging.finalize_count(), 0);
        assert_eq!(
            staging.calls().last(),
            Some(&FlashCall::Invalidate(ImageKind::Application))
        );
        assert!(!staging.is_valid(ImageKind::Application));
    }

    #[test]
    fn it_should_re_request_the_expected_packet_until_the_retry_limit() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        engine.handle(secs(0), data(0, &image[..20]));
        engine.handle(secs(0), data(1, &image[20..40]));

        assert_eq!(engine.handle(secs(1), Event::Tick), None);

        let mut now = secs(0);

        for _ in 0..Config::default().retry_limit {
            now += TIMEOUT;

            assert_eq!(
                engine.handle(now, Event::Tick),
                Some(Reply::Nack(2, NackReason::Timeout))
            );
        }

        now += TIMEOUT;

        assert_eq!(
            engine.handle(now, Event::Tick),
            Some(Reply::Nack(2, NackReason::Aborted))
        );
        assert_eq!(engine.state(), OtaState::Aborted);
        assert_eq!(engine.status().last_error, Some(SessionError::TransportTimeout));
    }

    #[test]
    fn it_should_reset_the_retry_counter_on_progress() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        assert_eq!(
            engine.handle(TIMEOUT, Event::Tick),
            Some(Reply::Nack(0, NackReason::Timeout))
        );
        assert_eq!(engine.session().retries, 1);

        engine.handle(TIMEOUT, data(0, &image[..20]));

        assert_eq!(engine.session().retries, 0);
        assert_eq!(engine.session().deadline, Some(TIMEOUT * 2));
    }

    #[test]
    fn it_should_time_out_waiting_for_the_header() {
        let mut engine = engine(1024);

        engine.handle(secs(0), packet(PacketType::Start));

        assert_eq!(
            engine.handle(TIMEOUT, Event::Tick),
            Some(Reply::Nack(0, NackReason::Timeout))
        );
        assert_eq!(engine.state(), OtaState::AwaitingHeader);
    }

    #[test]
    fn it_should_abort_on_a_length_mismatch() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        engine.handle(secs(1), data(0, &image[..20]));

        assert_eq!(
            engine.handle(secs(1), packet(PacketType::End)),
            Some(Reply::Nack(0, NackReason::LengthMismatch))
        );
        assert_eq!(
            engine.status().last_error,
            Some(SessionError::LengthMismatch {
                declared: 100,
                received: 20
            })
        );
    }

    #[test]
    fn it_should_refuse_data_that_overruns_the_declared_size() {
        let image = image();
        let mut engine = receiving(&image[..30], 1024);

        engine.handle(secs(1), data(0, &image[..20]));

        assert_eq!(
            engine.handle(secs(1), data(1, &image[20..40])),
            Some(Reply::Nack(1, NackReason::LengthMismatch))
        );
        assert_eq!(engine.state(), OtaState::ReceivingData);
        assert_eq!(engine.status().bytes_written, 20);
    }

    #[test]
    fn it_should_abort_when_the_link_is_lost() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        engine.handle(secs(1), data(0, &image[..20]));

        assert_eq!(engine.handle(secs(1), Event::LinkLost), None);
        assert_eq!(engine.state(), OtaState::Aborted);
        assert_eq!(engine.status().last_error, Some(SessionError::ConnectionLost));
        assert_eq!(
            engine.staging().calls().last(),
            Some(&FlashCall::Invalidate(ImageKind::Application))
        );
    }

    #[test]
    fn it_should_acknowledge_an_abort_from_the_peer() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        assert_eq!(
            engine.handle(secs(1), Event::Packet(OtaPacket::empty(PacketType::Abort, 7))),
            Some(Reply::Ack(7))
        );
        assert_eq!(engine.status().last_error, Some(SessionError::AbortedByPeer));
    }

    #[test]
    fn it_should_abort_when_programming_fails() {
        let image = image();
        let mut engine = OtaEngine::new(
            MemoryStaging::new(1024).fail_programs_after(1),
            Config::default(),
        );

        engine.handle(secs(0), packet(PacketType::Start));
        engine.handle(
            secs(0),
            Event::Packet(header(100, crc32(&image), ImageKind::Application)),
        );
        engine.handle(secs(0), data(0, &image[..20]));

        assert_eq!(
            engine.handle(secs(0), data(1, &image[20..40])),
            Some(Reply::Nack(1, NackReason::FlashWriteFailed))
        );
        assert_eq!(engine.status().last_error, Some(SessionError::FlashWriteFailed));
    }

    #[test]
    fn it_should_abort_on_an_unknown_image_kind() {
        let mut engine = engine(1024);
        let mut payload = header(10, 0, ImageKind::Application).payload;
        payload[15] = 9;

        engine.handle(secs(0), packet(PacketType::Start));

        assert_eq!(
            engine.handle(
                secs(0),
                Event::Packet(OtaPacket::new(PacketType::Header, 0, payload))
            ),
            Some(Reply::Nack(0, NackReason::UnknownImageKind))
        );
        assert_eq!(
            engine.status().last_error,
            Some(SessionError::UnknownImageKind(9))
        );
    }

    #[test]
    fn it_should_ignore_packets_while_idle() {
        let mut engine = engine(1024);

        assert_eq!(engine.handle(secs(0), data(0, b"stray")), None);
        assert_eq!(engine.handle(secs(0), packet(PacketType::End)), None);
        assert_eq!(engine.state(), OtaState::Idle);
    }

    #[test]
    fn it_should_re_acknowledge_repeated_start_and_header() {
        let image = image();
        let mut engine = engine(1024);
        let header = header(100, crc32(&image), ImageKind::CustomData);

        engine.handle(secs(0), packet(PacketType::Start));

        assert_eq!(engine.handle(secs(0), packet(PacketType::Start)), Some(Reply::Ack(0)));
        assert_eq!(engine.state(), OtaState::AwaitingHeader);

        engine.handle(secs(0), Event::Packet(header.clone()));

        assert_eq!(engine.handle(secs(0), Event::Packet(header)), Some(Reply::Ack(0)));
        assert_eq!(
            engine.handle(secs(0), packet(PacketType::Start)),
            Some(Reply::Nack(0, NackReason::UnexpectedPacket))
        );
        assert_eq!(engine.status().image_kind, Some(ImageKind::CustomData));
    }

    #[test]
    fn it_should_return_to_idle_on_reset() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        engine.handle(secs(0), Event::LinkLost);
        engine.reset();

        assert_eq!(
            engine.status(),
            SessionStatus {
                state: OtaState::Idle,
                image_kind: None,
                bytes_written: 0,
                declared_size: None,
                last_error: None,
            }
        );
    }

    #[test]
    fn it_should_re_acknowledge_end_after_a_committed_session_is_reset() {
        let image = image();
        let mut engine = receiving(&image, 1024);

        for (number, chunk) in image.chunks(50).enumerate() {
            engine.handle(secs(1), data(number as u16, chunk));
        }

        assert_eq!(engine.handle(secs(1), packet(PacketType::End)), Some(Reply::Ack(0)));

        engine.reset();

        assert_eq!(engine.state(), OtaState::Idle);
        assert_eq!(engine.handle(secs(2), packet(PacketType::End)), Some(Reply::Ack(0)));
        assert_eq!(engine.staging().finalize_count(), 1);

        // A new session forgets the old commit
        assert_eq!(engine.handle(secs(3), packet(PacketType::Start)), Some(Reply::Ack(0)));
        engine.reset();

        assert_eq!(engine.handle(secs(4), packet(PacketType::End)), None);
    }
}
