use std::ffi::OsStr;
use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use log::trace;
use serialport::prelude::*;

use crate::Error;

/// A duplex byte channel.
///
/// Reads never block: `read_available` returns whatever has arrived since the last call, which
/// may be nothing at all.
pub trait Transport {
    /// Returns the bytes that have arrived since the last call, possibly none
    fn read_available(&mut self) -> Result<Vec<u8>, Error>;

    /// Writes all of `bytes` to the channel
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        (**self).read_available()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).write(bytes)
    }
}

/// Serial connection with an open serial port.
pub struct SerialTransport {
    inner_port: Box<dyn serialport::SerialPort>,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.inner_port.name())
            .field("settings", &self.inner_port.settings())
            .finish()
    }
}

impl SerialTransport {
    /// Opens the given `port` as a `SerialTransport` with the given `baud_rate`, 8N1 and no flow
    /// control, which is what the HM-10 expects.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use hm10_ota::SerialTransport;
    ///
    /// let port = SerialTransport::open("/dev/ttyUSB0", 9600)?;
    ///
    /// # Ok::<(), hm10_ota::Error>(())
    /// ```
    pub fn open<S: AsRef<OsStr>>(port: S, baud_rate: u32) -> Result<SerialTransport, Error> {
        let settings = SerialPortSettings {
            baud_rate,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(50),
        };

        let serial_port = serialport::open_with_settings(port.as_ref(), &settings).map_err(|err| {
            Error::SerialOpen(port.as_ref().to_string_lossy().into_owned(), err)
        })?;

        Ok(SerialTransport {
            inner_port: serial_port,
        })
    }

    /// Consumes `self` and returns the inner serial port.
    pub fn into_port(self) -> Box<dyn serialport::SerialPort> {
        self.inner_port
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        let pending = self.inner_port.bytes_to_read()? as usize;

        if pending == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; pending];
        let len = self.inner_port.read(&mut buf)?;
        buf.truncate(len);

        trace!("rx {:02x?}", buf);

        Ok(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!("tx {:02x?}", bytes);

        self.inner_port.write_all(bytes)?;
        self.inner_port.flush()?;

        Ok(())
    }
}
