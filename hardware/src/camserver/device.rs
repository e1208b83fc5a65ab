//! Camserver line protocol.
//!
//! The camserver process fronts the controller electronics and accepts one
//! ASCII command per line, LF-terminated. Every command is answered with a
//! single reply line:
//!
//! ```text
//! OK [value ...]\n
//! BUSY [message]\n
//! ERROR message\n
//! ```
//!
//! `BUSY` marks a transient condition the caller may retry. Bulk image data is
//! requested with `READIMAGE <bytes>`; the server answers `OK <bytes>` and then
//! streams exactly that many raw bytes.
//!
//! # Example
//!
//! ```no_run
//! use hardware::camserver::CamServerDevice;
//!
//! let mut device = CamServerDevice::connect("192.168.1.20:2405")?;
//! let values = device.query("REMTIME")?;
//! println!("Remaining: {}", values[0]);
//! # Ok::<(), hardware::ControllerError>(())
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use crate::controller::{ControllerError, ControllerResult};

/// Default TCP port of the camserver process.
pub const DEFAULT_PORT: u16 = 2405;

/// Default timeout for command replies.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection to a camserver process.
pub struct CamServerDevice {
    stream: TcpStream,
    timeout: Duration,
}

impl CamServerDevice {
    /// Connect to a camserver at the given address.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ConnectionFailed`] if no address accepts
    /// the connection within the default timeout.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ControllerResult<Self> {
        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| ControllerError::ConnectionFailed(format!("Bad address: {e}")))?
            .collect();

        let mut last_error = None;
        for candidate in addrs {
            match TcpStream::connect_timeout(&candidate, DEFAULT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
                    stream.set_write_timeout(Some(DEFAULT_TIMEOUT))?;
                    debug!("Connected to camserver at {candidate}");
                    return Ok(Self {
                        stream,
                        timeout: DEFAULT_TIMEOUT,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(ControllerError::ConnectionFailed(match last_error {
            Some(e) => format!("Failed to connect: {e}"),
            None => "No address to connect to".to_string(),
        }))
    }

    /// Set the timeout for read/write operations.
    ///
    /// Long readouts need a timeout larger than the 10 s default.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        let _ = self.stream.set_read_timeout(Some(timeout));
        let _ = self.stream.set_write_timeout(Some(timeout));
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a raw command line without waiting for the reply.
    pub fn send(&mut self, command: &str) -> ControllerResult<()> {
        let mut msg = command.to_string();
        if !msg.ends_with('\n') {
            msg.push('\n');
        }

        debug!("camserver send: {:?}", msg.trim());
        self.stream.write_all(msg.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one LF-terminated reply line, without the terminator.
    pub fn read_line(&mut self) -> ControllerResult<String> {
        let mut buf = [0u8; 1];
        let mut bytes = Vec::new();

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(ControllerError::Timeout),
                Ok(_) => {
                    if buf[0] == b'\n' {
                        break;
                    }
                    bytes.push(buf[0]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Err(ControllerError::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let line = String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string();
        trace!("camserver recv: {:?}", line);
        Ok(line)
    }

    /// Send a command and return the values following `OK`.
    pub fn query(&mut self, command: &str) -> ControllerResult<Vec<String>> {
        self.send(command)?;
        let reply = self.read_line()?;
        Self::parse_reply(&reply)
    }

    /// Send a command that returns no values.
    pub fn command(&mut self, command: &str) -> ControllerResult<()> {
        self.query(command).map(|_| ())
    }

    /// Send a command and parse the first reply value as a number.
    pub fn query_f64(&mut self, command: &str) -> ControllerResult<f64> {
        let values = self.query(command)?;
        Self::parse_value(&values, 0)
    }

    /// Read exactly `count` raw bytes following an `OK <count>` reply.
    pub fn read_bytes(&mut self, count: usize) -> ControllerResult<Vec<u8>> {
        let mut data = vec![0u8; count];
        let mut received = 0;
        while received < count {
            match self.stream.read(&mut data[received..]) {
                Ok(0) => {
                    return Err(ControllerError::Transfer(format!(
                        "connection closed after {received} of {count} bytes"
                    )))
                }
                Ok(n) => received += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Err(ControllerError::Transfer(format!(
                        "timeout after {received} of {count} bytes"
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
        trace!("camserver received {count} image bytes");
        Ok(data)
    }

    /// Split a reply line into its values, mapping `BUSY`/`ERROR` to errors.
    ///
    /// # Example
    ///
    /// ```
    /// use hardware::camserver::CamServerDevice;
    ///
    /// let values = CamServerDevice::parse_reply("OK -110.2 -181.0").unwrap();
    /// assert_eq!(values, vec!["-110.2", "-181.0"]);
    /// assert!(CamServerDevice::parse_reply("BUSY").unwrap_err().is_transient());
    /// ```
    pub fn parse_reply(reply: &str) -> ControllerResult<Vec<String>> {
        let mut tokens = reply.split_whitespace();
        let status = tokens.next().unwrap_or("");
        let rest: Vec<String> = tokens.map(str::to_string).collect();

        match status.to_ascii_uppercase().as_str() {
            "OK" => Ok(rest),
            "BUSY" => Err(ControllerError::Busy(rest.join(" "))),
            "ERROR" => Err(ControllerError::CommandFailed(rest.join(" "))),
            _ => Err(ControllerError::InvalidResponse(reply.to_string())),
        }
    }

    /// Parse value `index` of a reply as a number.
    pub fn parse_value(values: &[String], index: usize) -> ControllerResult<f64> {
        let raw = values.get(index).ok_or_else(|| {
            ControllerError::InvalidResponse(format!("missing value {index} in {values:?}"))
        })?;
        raw.parse()
            .map_err(|_| ControllerError::InvalidResponse(format!("Invalid number: {raw}")))
    }
}
