//! Delivery of finished images to remote image servers.
//!
//! Three wire dialects are spoken, selected by [`ServerDialect`]:
//!
//! - **azcam / dataserver**: a 256-byte ASCII header
//!   `"%16d %s %d %d %d %d"` (file bytes, remote name, file type code, width,
//!   height, display flag), left-justified and space padded, followed by the
//!   image file. The azcam image server answers with a 2-byte status whose
//!   first digit must be `0`; the data server sends nothing and the socket is
//!   held open for 3 s before closing.
//! - **ccdacq**: `"<width> <height>\r\n"`, `"NoFilename NoImageType\r\n"`,
//!   then raw little-endian 16-bit pixels. A single acknowledgement byte is
//!   read if the peer sends one.
//! - **lbtguider / mmtguider**: `"<bytes>\r\n"` followed by the image file.
//!
//! Every call opens a fresh connection, which is closed when the stream is
//! dropped on any exit path.

use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::filename::FileType;
use shared::pixel_buffer::{PixelBuffer, PixelError};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, info};

/// Size of the azcam/dataserver text header.
pub const AZCAM_HEADER_LEN: usize = 256;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(10);
const DATASERVER_LINGER: Duration = Duration::from_secs(3);

/// Errors from sending an image to a remote server.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Connection could not be established.
    #[error("Remote image server {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer stopped accepting data part way through.
    #[error("Short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    /// Reply could not be parsed as a status code.
    #[error("Bad status reply from remote image server: {0:?}")]
    BadReply(String),

    /// Remote server reported a failure.
    #[error("Remote image server returned status {0}")]
    RemoteStatus(u32),

    /// File-based dialects need an image file on disk.
    #[error("{0} delivery requires a written image file")]
    NoFile(ServerDialect),

    #[error("Pixel data error: {0}")]
    Pixel(#[from] PixelError),
}

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Wire dialect spoken by the remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ServerDialect {
    Azcam,
    DataServer,
    Ccdacq,
    LbtGuider,
    MmtGuider,
}

impl ServerDialect {
    /// Dialects that transmit the image file rather than raw pixels.
    pub fn sends_file(&self) -> bool {
        !matches!(self, ServerDialect::Ccdacq)
    }
}

/// Where and how to deliver images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServerDescriptor {
    pub host: String,
    pub port: u16,
    pub dialect: ServerDialect,
    /// Name announced to the server in place of the local file name
    #[serde(default)]
    pub remote_filename: Option<String>,
}

impl RemoteServerDescriptor {
    pub fn new(host: &str, port: u16, dialect: ServerDialect) -> Self {
        Self {
            host: host.to_string(),
            port,
            dialect,
            remote_filename: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RemoteServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.address(), self.dialect)
    }
}

/// Everything a send needs besides the destination.
pub struct OutgoingImage<'a> {
    pub image: &'a mut PixelBuffer,
    /// Local image file, required by file-based dialects
    pub file: Option<&'a Path>,
    /// Name announced to azcam/dataserver peers
    pub remote_name: &'a str,
    pub file_type: FileType,
    pub display: bool,
}

/// Format the fixed 256-byte azcam header.
///
/// Longer headers are truncated, shorter ones padded with spaces.
pub fn format_azcam_header(
    byte_count: usize,
    remote_name: &str,
    file_type: FileType,
    width: usize,
    height: usize,
    display: bool,
) -> Vec<u8> {
    let text = format!(
        "{:16} {} {} {} {} {}",
        byte_count,
        remote_name,
        file_type.code(),
        width,
        height,
        u8::from(display)
    );
    let mut header = text.into_bytes();
    header.resize(AZCAM_HEADER_LEN, b' ');
    header
}

/// Write all of `data`, reporting how far a failed write got.
fn write_counted(stream: &mut TcpStream, data: &[u8]) -> DeliveryResult<()> {
    let mut sent = 0;
    while sent < data.len() {
        match stream.write(&data[sent..]) {
            Ok(0) => {
                return Err(DeliveryError::ShortWrite {
                    sent,
                    expected: data.len(),
                })
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                ) =>
            {
                debug!("Write stopped after {sent} bytes: {e}");
                return Err(DeliveryError::ShortWrite {
                    sent,
                    expected: data.len(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    stream.flush()?;
    Ok(())
}

/// Stateless client for the remote image server dialects.
#[derive(Debug, Clone)]
pub struct RemoteDeliveryClient {
    connect_timeout: Duration,
    io_timeout: Duration,
    dataserver_linger: Duration,
}

impl Default for RemoteDeliveryClient {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            io_timeout: IO_TIMEOUT,
            dataserver_linger: DATASERVER_LINGER,
        }
    }
}

impl RemoteDeliveryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the pause before closing a data server connection.
    pub fn with_dataserver_linger(mut self, linger: Duration) -> Self {
        self.dataserver_linger = linger;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Send one image to the server described by `descriptor`.
    pub fn send(
        &self,
        descriptor: &RemoteServerDescriptor,
        outgoing: OutgoingImage<'_>,
    ) -> DeliveryResult<()> {
        if !outgoing.image.is_valid() {
            return Err(PixelError::NotValid.into());
        }

        let file_bytes = if descriptor.dialect.sends_file() {
            let path = outgoing
                .file
                .ok_or(DeliveryError::NoFile(descriptor.dialect))?;
            Some(std::fs::read(path)?)
        } else {
            None
        };

        let mut stream = self.connect(descriptor)?;
        info!("Sending image to {descriptor}");

        match (descriptor.dialect, file_bytes) {
            (ServerDialect::Ccdacq, _) => self.send_ccdacq(&mut stream, outgoing.image)?,
            (ServerDialect::Azcam, Some(bytes)) | (ServerDialect::DataServer, Some(bytes)) => {
                let remote_name = descriptor
                    .remote_filename
                    .as_deref()
                    .unwrap_or(outgoing.remote_name);
                let size = outgoing.image.size();
                let header = format_azcam_header(
                    bytes.len(),
                    remote_name,
                    outgoing.file_type,
                    size.width,
                    size.height,
                    outgoing.display,
                );
                write_counted(&mut stream, &header)?;
                write_counted(&mut stream, &bytes)?;
                if descriptor.dialect == ServerDialect::Azcam {
                    Self::read_azcam_status(&mut stream)?;
                } else {
                    std::thread::sleep(self.dataserver_linger);
                }
            }
            (ServerDialect::LbtGuider, Some(bytes)) | (ServerDialect::MmtGuider, Some(bytes)) => {
                write_counted(&mut stream, format!("{}\r\n", bytes.len()).as_bytes())?;
                write_counted(&mut stream, &bytes)?;
            }
            (dialect, None) => return Err(DeliveryError::NoFile(dialect)),
        }

        info!("Finished sending image");
        Ok(())
    }

    fn connect(&self, descriptor: &RemoteServerDescriptor) -> DeliveryResult<TcpStream> {
        let addr = descriptor.address();
        let unreachable = |reason: String| DeliveryError::Unreachable {
            addr: addr.clone(),
            reason,
        };

        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| unreachable(e.to_string()))?
            .collect();
        let mut last_error = "no address resolved".to_string();
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    debug!("Connected to remote image server {candidate}");
                    return Ok(stream);
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(unreachable(last_error))
    }

    fn send_ccdacq(&self, stream: &mut TcpStream, image: &mut PixelBuffer) -> DeliveryResult<()> {
        let size = image.size();
        let pixels = image.frame_bytes()?;

        write_counted(stream, format!("{} {}\r\n", size.width, size.height).as_bytes())?;
        write_counted(stream, b"NoFilename NoImageType\r\n")?;
        write_counted(stream, &pixels)?;

        // Optional acknowledgement; silence or a closed socket is fine
        let mut ack = [0u8; 1];
        match stream.read(&mut ack) {
            Ok(n) => debug!("ccdacq acknowledgement: {n} byte(s)"),
            Err(e) => debug!("No ccdacq acknowledgement: {e}"),
        }
        Ok(())
    }

    fn read_azcam_status(stream: &mut TcpStream) -> DeliveryResult<()> {
        let mut reply = [0u8; 16];
        let n = stream.read(&mut reply)?;
        if n != 2 {
            return Err(DeliveryError::BadReply(
                String::from_utf8_lossy(&reply[..n]).to_string(),
            ));
        }
        let status = char::from(reply[0])
            .to_digit(10)
            .ok_or_else(|| DeliveryError::BadReply(String::from_utf8_lossy(&reply[..n]).to_string()))?;
        if status != 0 {
            return Err(DeliveryError::RemoteStatus(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::geometry::{DetectorFormat, Geometry};
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    fn ramp_image(width: i64, height: i64) -> PixelBuffer {
        let format = DetectorFormat::from_values([width, 0, 0, 0, height, 0, 0, 0, 0]).unwrap();
        let mut image = PixelBuffer::new(&Geometry::new(format));
        image.fill_ramp();
        image
    }

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_header_is_always_256_bytes() {
        for len in [0, 1, 200, 218, 219, 220, 255, 256, 300] {
            let name = "x".repeat(len);
            let header = format_azcam_header(1234, &name, FileType::Fits, 2708, 512, false);
            assert_eq!(header.len(), AZCAM_HEADER_LEN, "name length {len}");
        }
    }

    #[test]
    fn test_header_layout() {
        let header = format_azcam_header(5760, "!/data/a.fits", FileType::Binary, 4, 2, true);
        let text = String::from_utf8(header).unwrap();
        assert!(text.starts_with("            5760 !/data/a.fits 2 4 2 1 "));
        assert!(text.trim_end().ends_with(" 1"));
    }

    #[test]
    fn test_dialect_names() {
        assert_eq!("dataserver".parse::<ServerDialect>().unwrap(), ServerDialect::DataServer);
        assert_eq!(ServerDialect::MmtGuider.to_string(), "mmtguider");
        assert!(!ServerDialect::Ccdacq.sends_file());
    }

    #[test]
    fn test_ccdacq_wire_format() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line1 = String::new();
            reader.read_line(&mut line1).unwrap();
            let mut line2 = String::new();
            reader.read_line(&mut line2).unwrap();
            let mut pixels = vec![0u8; 4 * 2 * 2];
            reader.read_exact(&mut pixels).unwrap();
            (stream, line1, line2, pixels)
        });

        let mut image = ramp_image(4, 2);
        let descriptor = RemoteServerDescriptor::new("127.0.0.1", port, ServerDialect::Ccdacq);
        let client = RemoteDeliveryClient::new().with_io_timeout(Duration::from_millis(200));

        // No acknowledgement is sent; the read times out and is tolerated
        client
            .send(
                &descriptor,
                OutgoingImage {
                    image: &mut image,
                    file: None,
                    remote_name: "unused",
                    file_type: FileType::Fits,
                    display: false,
                },
            )
            .unwrap();

        let (_stream, line1, line2, pixels) = server.join().unwrap();
        assert_eq!(line1, "4 2\r\n");
        assert_eq!(line2, "NoFilename NoImageType\r\n");
        assert_eq!(u16::from_le_bytes([pixels[14], pixels[15]]), 7);
    }

    #[test]
    fn test_guider_wire_format() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("guide.fits");
        std::fs::write(&file, b"SIMPLE  =  T").unwrap();

        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let mut image = ramp_image(4, 2);
        let descriptor = RemoteServerDescriptor::new("127.0.0.1", port, ServerDialect::LbtGuider);
        RemoteDeliveryClient::new()
            .send(
                &descriptor,
                OutgoingImage {
                    image: &mut image,
                    file: Some(&file),
                    remote_name: "unused",
                    file_type: FileType::Fits,
                    display: false,
                },
            )
            .unwrap();

        assert_eq!(server.join().unwrap(), b"12\r\nSIMPLE  =  T".to_vec());
    }

    #[test]
    fn test_azcam_status_checked() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.fits");
        std::fs::write(&file, vec![7u8; 100]).unwrap();

        let run = |status: &'static [u8]| {
            let (listener, port) = listener();
            let server = thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let mut header = [0u8; AZCAM_HEADER_LEN];
                stream.read_exact(&mut header).unwrap();
                let mut data = [0u8; 100];
                stream.read_exact(&mut data).unwrap();
                stream.write_all(status).unwrap();
                String::from_utf8(header.to_vec()).unwrap()
            });

            let mut image = ramp_image(4, 2);
            let mut descriptor =
                RemoteServerDescriptor::new("127.0.0.1", port, ServerDialect::Azcam);
            descriptor.remote_filename = Some("/remote/override.fits".to_string());
            let result = RemoteDeliveryClient::new().send(
                &descriptor,
                OutgoingImage {
                    image: &mut image,
                    file: Some(&file),
                    remote_name: "!/local/a.fits",
                    file_type: FileType::Fits,
                    display: false,
                },
            );
            (result, server.join().unwrap())
        };

        let (result, header) = run(b"0 ");
        result.unwrap();
        assert!(header.contains(" /remote/override.fits 0 4 2 0"));

        let (result, _) = run(b"3 ");
        assert!(matches!(result, Err(DeliveryError::RemoteStatus(3))));

        let (result, _) = run(b"0");
        assert!(matches!(result, Err(DeliveryError::BadReply(_))));
    }

    #[test]
    fn test_dataserver_skips_reply() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.bin");
        std::fs::write(&file, vec![1u8; 16]).unwrap();

        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received.len()
        });

        let mut image = ramp_image(4, 2);
        let descriptor = RemoteServerDescriptor::new("127.0.0.1", port, ServerDialect::DataServer);
        RemoteDeliveryClient::new()
            .with_dataserver_linger(Duration::from_millis(10))
            .send(
                &descriptor,
                OutgoingImage {
                    image: &mut image,
                    file: Some(&file),
                    remote_name: "a.bin",
                    file_type: FileType::Binary,
                    display: false,
                },
            )
            .unwrap();

        assert_eq!(server.join().unwrap(), AZCAM_HEADER_LEN + 16);
    }

    #[test]
    fn test_unreachable_server() {
        let (listener, port) = listener();
        drop(listener);

        let mut image = ramp_image(4, 2);
        let descriptor = RemoteServerDescriptor::new("127.0.0.1", port, ServerDialect::Ccdacq);
        let result = RemoteDeliveryClient::new().send(
            &descriptor,
            OutgoingImage {
                image: &mut image,
                file: None,
                remote_name: "",
                file_type: FileType::Fits,
                display: false,
            },
        );
        assert!(matches!(result, Err(DeliveryError::Unreachable { .. })));
    }

    #[test]
    fn test_file_dialect_requires_file() {
        let mut image = ramp_image(4, 2);
        let descriptor = RemoteServerDescriptor::new("127.0.0.1", 1, ServerDialect::MmtGuider);
        let result = RemoteDeliveryClient::new().send(
            &descriptor,
            OutgoingImage {
                image: &mut image,
                file: None,
                remote_name: "",
                file_type: FileType::Fits,
                display: false,
            },
        );
        assert!(matches!(result, Err(DeliveryError::NoFile(ServerDialect::MmtGuider))));
    }
}
