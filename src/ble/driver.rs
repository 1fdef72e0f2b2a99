use std::time::Duration;

use log::{debug, info, trace, warn};

use super::command::{
    self, AddressType, AtCommand, BtAddress, PinCodeMode, Role, WorkMode, WorkType,
};
use super::response::{match_shapes, AtResponse, Match, Shape};
use super::ConnectFailure;
use crate::{Clock, Config, Error, SessionError, Transport};

/// Notification the module emits when a central connects
const CONNECTED_NOTIFICATION: &[u8] = b"OK+CONN";
/// Notification the module emits when the link drops
const LOST_NOTIFICATION: &[u8] = b"OK+LOST";
/// Bytes of a notification that may still be waiting for the rest of it
const NOTIFICATION_TAIL: usize = 6;

/// Settings applied by `Hm10::restore_defaults`
pub const DEFAULT_NAME: &str = "BLE-OTA";
pub const DEFAULT_PIN: &str = "000000";
pub const DEFAULT_ROLE: Role = Role::Peripheral;
pub const DEFAULT_PIN_CODE_MODE: PinCodeMode = PinCodeMode::Disabled;
pub const DEFAULT_WORK_MODE: WorkMode = WorkMode::Transmission;

/// How incoming bytes are interpreted
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    /// Bytes are AT responses and notifications
    Command,
    /// Bytes are payload from the connected peer
    Transparent,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    NoConnection,
    Connected,
    ConnectionLost,
    Unknown,
}

/// The AT response currently awaited
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingRequest {
    /// What was sent, for diagnostics
    pub command: String,
    pub shapes: Vec<Shape>,
    pub deadline: Duration,
}

/// Connection and mode tracking, owned by the driver
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkState {
    pub mode: Mode,
    pub status: ConnectionStatus,
    pub peer: Option<BtAddress>,
    pub pending: Option<PendingRequest>,
}

impl Default for LinkState {
    fn default() -> LinkState {
        LinkState {
            mode: Mode::Command,
            status: ConnectionStatus::Unknown,
            peer: None,
            pending: None,
        }
    }
}

/// Driver for an HM-10 module attached to a `Transport`.
///
/// The driver hides the module's two personalities: while in `Mode::Command` every byte the
/// module sends is matched against the outstanding AT request, and while in `Mode::Transparent`
/// the bytes are payload from the peer. At most one AT request may be outstanding.
pub struct Hm10<T, C> {
    transport: T,
    clock: C,
    config: Config,
    link: LinkState,
    /// Accumulated AT response bytes
    response: Vec<u8>,
    /// Payload received and not yet handed out
    payload: Vec<u8>,
    /// Trailing payload bytes that could be the start of `OK+LOST`
    held: Vec<u8>,
    last_rx: Duration,
}

impl<T: Transport, C: Clock> Hm10<T, C> {
    pub fn new(transport: T, clock: C, config: Config) -> Hm10<T, C> {
        Hm10 {
            transport,
            clock,
            config,
            link: LinkState::default(),
            response: Vec::new(),
            payload: Vec::new(),
            held: Vec::new(),
            last_rx: Duration::from_secs(0),
        }
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    pub fn mode(&self) -> Mode {
        self.link.mode
    }

    pub fn status(&self) -> ConnectionStatus {
        self.link.status
    }

    pub fn peer(&self) -> Option<BtAddress> {
        self.link.peer
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns `true` when payload can flow to and from a connected peer
    pub fn transport_ready(&self) -> bool {
        self.link.mode == Mode::Transparent && self.link.status == ConnectionStatus::Connected
    }

    /// Returns `true` once a connection has been lost and not yet re-established
    pub fn transport_lost(&self) -> bool {
        self.link.status == ConnectionStatus::ConnectionLost
    }

    /// Marks the link as lost, for when loss is detected outside the serial stream
    pub fn mark_link_lost(&mut self) {
        self.set_status(ConnectionStatus::ConnectionLost);
        self.link.peer = None;
    }

    /// Discards every unconsumed byte, both buffered and still waiting in the transport.
    ///
    /// Draining stops after the AT timeout even if the line never goes quiet. Returns the number
    /// of bytes discarded.
    pub fn flush_receive_buffer(&mut self) -> Result<usize, Error> {
        let mut discarded = self.response.len() + self.held.len();
        self.response.clear();
        self.held.clear();

        let deadline = self.clock.now() + self.config.at_timeout;

        loop {
            let bytes = self.transport.read_available()?;

            if bytes.is_empty() {
                break;
            }

            discarded += bytes.len();

            if self.clock.now() >= deadline {
                warn!("The line is still busy after discarding {} bytes", discarded);
                break;
            }
        }

        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }

        Ok(discarded)
    }

    /// Writes `command` and makes it the outstanding request
    pub fn begin_request(&mut self, command: &AtCommand) -> Result<(), Error> {
        if self.link.mode != Mode::Command {
            return Err(Error::WrongMode);
        }

        self.issue(command)
    }

    /// Reads whatever has arrived and tries to resolve the outstanding request.
    ///
    /// Returns `Ok(None)` while the response is still incomplete and the deadline has not
    /// passed. Once resolved, successfully or not, the request slot is free again.
    pub fn poll_request(&mut self) -> Result<Option<AtResponse>, Error> {
        let bytes = self.transport.read_available()?;
        let now = self.clock.now();

        if !bytes.is_empty() {
            self.last_rx = now;
            self.route(bytes);
        }

        let pending = match &self.link.pending {
            Some(pending) => pending,
            None => return Ok(None),
        };

        match match_shapes(&self.response, &pending.shapes) {
            Match::Complete {
                shape,
                ambiguous: false,
            } => Ok(Some(self.resolve(shape))),
            Match::Complete {
                shape,
                ambiguous: true,
            } => {
                let quiet = now.saturating_sub(self.last_rx) >= self.config.at_quiet_gap;

                if quiet || now >= pending.deadline {
                    Ok(Some(self.resolve(shape)))
                } else {
                    Ok(None)
                }
            }
            Match::Partial if now < pending.deadline => Ok(None),
            Match::Partial | Match::Mismatch => Err(self.reject()),
        }
    }

    /// Sends `command` and waits for one of its expected responses.
    ///
    /// Partial responses are accumulated until they match, the line goes quiet after an
    /// ambiguous match, or the AT timeout expires.
    pub fn send_command(&mut self, command: &AtCommand) -> Result<AtResponse, Error> {
        self.begin_request(command)?;
        self.finish_request()
    }

    /// Issues `AT` and waits for the module to acknowledge that it is listening for commands.
    ///
    /// The module drops any active connection when this happens, which is reflected in the link
    /// status. One retry is made before giving up with `Error::TransportTimeout`.
    pub fn enter_command_mode(&mut self) -> Result<(), Error> {
        let previous = self.link.mode;
        let was_connected = self.link.status == ConnectionStatus::Connected;

        self.set_mode(Mode::Command);

        let response = match self.exchange_with_retry(&AtCommand::Test) {
            Ok(response) => response,
            Err(err) => {
                self.set_mode(previous);
                return Err(err);
            }
        };

        // OK+LOST means the command tore down a connection
        if response.shape == 1 || was_connected {
            self.set_status(ConnectionStatus::ConnectionLost);
        } else {
            self.set_status(ConnectionStatus::NoConnection);
        }

        self.link.peer = None;

        Ok(())
    }

    /// Issues `AT+START` and switches to transparent data mode once it is acknowledged.
    ///
    /// One retry is made before giving up with `Error::TransportTimeout`.
    pub fn enter_data_mode(&mut self) -> Result<(), Error> {
        if self.link.mode != Mode::Command {
            return Err(Error::WrongMode);
        }

        self.exchange_with_retry(&AtCommand::Start)?;
        self.set_mode(Mode::Transparent);

        Ok(())
    }

    /// Connects to the peripheral at `address`.
    ///
    /// The module first echoes that it is connecting and then, after a delay, notifies that the
    /// connection is up. When the second notification does not arrive within the connect timeout
    /// the result is `ConnectionStatus::ConnectionLost`.
    pub fn connect_to_address(
        &mut self,
        address: BtAddress,
        address_type: AddressType,
    ) -> Result<ConnectionStatus, Error> {
        let command = AtCommand::Connect {
            address,
            address_type,
        };

        info!("Connecting to {}", address);

        let response = self.send_command(&command)?;

        match response.value.as_slice() {
            [kind, b'A'] if *kind == u8::from(address_type) => {}
            [kind, b'E'] if *kind == u8::from(address_type) => {
                return Err(Error::ConnectFailed(ConnectFailure::Error))
            }
            [kind, b'F'] if *kind == u8::from(address_type) => {
                return Err(Error::ConnectFailed(ConnectFailure::Fail))
            }
            _ => {
                return Err(Error::UnexpectedResponse {
                    command: command.to_string(),
                    response: [b"OK+CO" as &[u8], &response.value].concat(),
                })
            }
        }

        let shapes = vec![
            Shape::exact(b"OK+CONN"),
            Shape::exact(b"OK+CONNE"),
            Shape::exact(b"OK+CONNF"),
        ];

        self.arm("connection notification", shapes, self.config.connect_timeout)?;

        match self.finish_request() {
            Ok(response) => match response.shape {
                0 => {
                    info!("Connected to {}", address);

                    self.link.peer = Some(address);
                    self.set_status(ConnectionStatus::Connected);
                    self.set_mode(Mode::Transparent);

                    Ok(ConnectionStatus::Connected)
                }
                1 => {
                    self.set_status(ConnectionStatus::NoConnection);
                    Err(Error::ConnectFailed(ConnectFailure::Error))
                }
                _ => {
                    self.set_status(ConnectionStatus::NoConnection);
                    Err(Error::ConnectFailed(ConnectFailure::Fail))
                }
            },
            Err(err) => {
                warn!("Connection to {} was not confirmed: {}", address, err);

                self.link.peer = None;
                self.set_status(ConnectionStatus::ConnectionLost);

                Ok(ConnectionStatus::ConnectionLost)
            }
        }
    }

    /// Drops any active connection by forcing command mode, and returns the resulting status
    pub fn disconnect(&mut self) -> Result<ConnectionStatus, Error> {
        match self.enter_command_mode() {
            Ok(()) => Ok(self.link.status),
            Err(err) => {
                self.set_status(ConnectionStatus::Unknown);
                Err(err)
            }
        }
    }

    /// Waits, in command mode, for a central to connect to us.
    ///
    /// Relies on connection notifications being enabled (`AT+NOTI1`).
    pub fn wait_for_connection(&mut self, timeout: Duration) -> Result<ConnectionStatus, Error> {
        let deadline = self.clock.now() + timeout;

        while self.clock.now() < deadline {
            let bytes = self.transport.read_available()?;

            if !bytes.is_empty() {
                self.route(bytes);
            }

            if self.link.status == ConnectionStatus::Connected {
                return Ok(ConnectionStatus::Connected);
            }

            std::thread::yield_now();
        }

        Err(Error::TransportTimeout)
    }

    /// Returns the payload that has arrived from the peer since the last call.
    ///
    /// Bytes that could be the start of a link-loss notification are held back until the rest
    /// arrives or the line has been quiet for the AT quiet gap.
    pub fn read_data(&mut self) -> Result<Vec<u8>, Error> {
        let bytes = self.transport.read_available()?;
        let now = self.clock.now();

        if !bytes.is_empty() {
            self.last_rx = now;
            self.route(bytes);
        } else if !self.held.is_empty()
            && now.saturating_sub(self.last_rx) >= self.config.at_quiet_gap
        {
            let held = std::mem::take(&mut self.held);
            self.payload.extend_from_slice(&held);
        }

        Ok(std::mem::take(&mut self.payload))
    }

    /// Sends payload to the connected peer
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.link.mode != Mode::Transparent {
            return Err(Error::WrongMode);
        }

        self.transport.write(bytes)
    }

    pub fn get_name(&mut self) -> Result<String, Error> {
        Ok(self.send_command(&AtCommand::GetName)?.value_str())
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), Error> {
        command::validate_name(name)?;
        self.set(AtCommand::SetName(name.to_owned()))
    }

    pub fn get_role(&mut self) -> Result<Role, Error> {
        command::decode_choice(&self.send_command(&AtCommand::GetRole)?.value)
    }

    pub fn set_role(&mut self, role: Role) -> Result<(), Error> {
        self.set(AtCommand::SetRole(role))
    }

    pub fn get_pin(&mut self) -> Result<String, Error> {
        Ok(self.send_command(&AtCommand::GetPin)?.value_str())
    }

    pub fn set_pin(&mut self, pin: &str) -> Result<(), Error> {
        command::validate_pin(pin)?;
        self.set(AtCommand::SetPin(pin.to_owned()))
    }

    pub fn get_pin_code_mode(&mut self) -> Result<PinCodeMode, Error> {
        command::decode_choice(&self.send_command(&AtCommand::GetPinCodeMode)?.value)
    }

    pub fn set_pin_code_mode(&mut self, mode: PinCodeMode) -> Result<(), Error> {
        self.set(AtCommand::SetPinCodeMode(mode))
    }

    pub fn get_work_mode(&mut self) -> Result<WorkMode, Error> {
        command::decode_choice(&self.send_command(&AtCommand::GetWorkMode)?.value)
    }

    pub fn set_work_mode(&mut self, mode: WorkMode) -> Result<(), Error> {
        self.set(AtCommand::SetWorkMode(mode))
    }

    pub fn get_work_type(&mut self) -> Result<WorkType, Error> {
        command::decode_choice(&self.send_command(&AtCommand::GetWorkType)?.value)
    }

    pub fn set_work_type(&mut self, work_type: WorkType) -> Result<(), Error> {
        self.set(AtCommand::SetWorkType(work_type))
    }

    pub fn set_notify(&mut self, enabled: bool) -> Result<(), Error> {
        self.set(AtCommand::SetNotify(enabled))
    }

    pub fn get_address(&mut self) -> Result<BtAddress, Error> {
        BtAddress::from_ascii(&self.send_command(&AtCommand::GetAddress)?.value)
    }

    /// Restores the factory setup (`AT+RENEW`)
    pub fn renew(&mut self) -> Result<(), Error> {
        self.send_command(&AtCommand::Renew).map(|_| ())
    }

    /// Restarts the module (`AT+RESET`)
    pub fn reset(&mut self) -> Result<(), Error> {
        self.send_command(&AtCommand::Reset)?;
        self.set_status(ConnectionStatus::NoConnection);

        Ok(())
    }

    /// Puts the module back into the configuration the updater expects: disconnected, factory
    /// renewed, default name, peripheral role, default PIN without PIN pairing, transparent
    /// transmission with connection notifications, and finally restarted.
    pub fn restore_defaults(&mut self) -> Result<(), Error> {
        info!("Restoring HM-10 default settings");

        self.disconnect()?;
        self.renew()?;
        self.set_name(DEFAULT_NAME)?;
        self.set_role(DEFAULT_ROLE)?;
        self.set_pin(DEFAULT_PIN)?;
        self.set_pin_code_mode(DEFAULT_PIN_CODE_MODE)?;
        self.set_work_mode(DEFAULT_WORK_MODE)?;
        self.set_notify(true)?;
        self.reset()?;

        info!("HM-10 default settings restored");

        Ok(())
    }

    /// Sends a setter and checks that the module echoed the requested value
    fn set(&mut self, command: AtCommand) -> Result<(), Error> {
        let response = self.send_command(&command)?;

        match command.echoed_value() {
            Some(expected) if expected != response.value => Err(Error::UnexpectedResponse {
                command: command.to_string(),
                response: response.value,
            }),
            _ => Ok(()),
        }
    }

    /// Flushes, writes `command` and arms the request slot, regardless of mode
    fn issue(&mut self, command: &AtCommand) -> Result<(), Error> {
        if self.link.pending.is_some() {
            return Err(Error::RequestPending);
        }

        self.flush_receive_buffer()?;

        debug!("> {}", command);

        self.transport.write(&command.to_vec())?;
        self.link.pending = Some(PendingRequest {
            command: command.to_string(),
            shapes: command.expected(),
            deadline: self.clock.now() + self.config.at_timeout,
        });

        Ok(())
    }

    /// Arms the request slot for a response that is not preceded by a command
    fn arm(&mut self, what: &str, shapes: Vec<Shape>, window: Duration) -> Result<(), Error> {
        if self.link.pending.is_some() {
            return Err(Error::RequestPending);
        }

        self.link.pending = Some(PendingRequest {
            command: what.to_owned(),
            shapes,
            deadline: self.clock.now() + window,
        });

        Ok(())
    }

    fn finish_request(&mut self) -> Result<AtResponse, Error> {
        loop {
            if let Some(response) = self.poll_request()? {
                return Ok(response);
            }

            std::thread::yield_now();
        }
    }

    fn exchange_with_retry(&mut self, command: &AtCommand) -> Result<AtResponse, Error> {
        for attempt in 1..=2 {
            self.issue(command)?;

            match self.finish_request() {
                Ok(response) => return Ok(response),
                Err(err @ Error::NoResponse { .. })
                | Err(err @ Error::UnexpectedResponse { .. }) => {
                    warn!("Attempt {} of {} failed: {}", attempt, command, err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::TransportTimeout)
    }

    fn resolve(&mut self, shape: usize) -> AtResponse {
        let prefix_len = self
            .link
            .pending
            .take()
            .map(|pending| pending.shapes[shape].prefix.len())
            .unwrap_or(0);

        debug!("< {}", String::from_utf8_lossy(&self.response));

        let value = self.response.split_off(prefix_len);
        self.response.clear();

        AtResponse { shape, value }
    }

    fn reject(&mut self) -> Error {
        let command = self
            .link
            .pending
            .take()
            .map(|pending| pending.command)
            .unwrap_or_default();
        let response = std::mem::take(&mut self.response);

        if response.is_empty() {
            Error::NoResponse { command }
        } else {
            Error::UnexpectedResponse { command, response }
        }
    }

    /// Routes incoming bytes according to the current mode
    fn route(&mut self, bytes: Vec<u8>) {
        trace!("{:?} rx {:02x?}", self.link.mode, bytes);

        match self.link.mode {
            Mode::Command => {
                self.response.extend_from_slice(&bytes);

                if self.link.pending.is_none() {
                    self.scan_notifications();
                }
            }
            Mode::Transparent => self.route_payload(bytes),
        }
    }

    /// Splits payload from a link-loss notification, which may straddle two reads
    fn route_payload(&mut self, bytes: Vec<u8>) {
        let mut bytes = [std::mem::take(&mut self.held), bytes].concat();

        if let Some(position) = find(&bytes, LOST_NOTIFICATION) {
            let rest = bytes.split_off(position + LOST_NOTIFICATION.len());
            bytes.truncate(position);
            self.payload.extend_from_slice(&bytes);

            warn!("Peer connection lost");

            self.mark_link_lost();
            self.set_mode(Mode::Command);

            // The module answers AT commands again from here on
            self.response.extend_from_slice(&rest);

            if self.link.pending.is_none() {
                self.scan_notifications();
            }

            return;
        }

        let split = bytes.len() - partial_suffix(&bytes, LOST_NOTIFICATION);
        self.held = bytes.split_off(split);
        self.payload.extend_from_slice(&bytes);
    }

    /// Consumes unsolicited connection notifications while no request is outstanding
    fn scan_notifications(&mut self) {
        if let Some(position) = find(&self.response, LOST_NOTIFICATION) {
            self.response.drain(..position + LOST_NOTIFICATION.len());
            self.mark_link_lost();
        }

        if let Some(position) = find(&self.response, CONNECTED_NOTIFICATION) {
            let rest = self.response.split_off(position + CONNECTED_NOTIFICATION.len());
            self.response.clear();

            info!("Peer connected");

            self.set_status(ConnectionStatus::Connected);
            self.set_mode(Mode::Transparent);

            if !rest.is_empty() {
                self.route_payload(rest);
            }

            return;
        }

        // Only the start of a notification split across reads is worth keeping
        if self.response.len() > NOTIFICATION_TAIL {
            let excess = self.response.len() - NOTIFICATION_TAIL;
            self.response.drain(..excess);
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.link.mode != mode {
            debug!("Mode {:?} -> {:?}", self.link.mode, mode);
            self.link.mode = mode;
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.link.status != status {
            debug!("Connection {:?} -> {:?}", self.link.status, status);
            self.link.status = status;
        }
    }
}

/// The payload channel to the connected peer
impl<T: Transport, C: Clock> Transport for Hm10<T, C> {
    fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        let bytes = self.read_data()?;

        if bytes.is_empty() && self.transport_lost() {
            return Err(Error::Session(SessionError::ConnectionLost));
        }

        Ok(bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_data(bytes)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Length of the longest proper prefix of `needle` that `haystack` ends with
fn partial_suffix(haystack: &[u8], needle: &[u8]) -> usize {
    (1..needle.len())
        .rev()
        .find(|&len| haystack.ends_with(&needle[..len]))
        .unwrap_or(0)
}
