//! ARC controller driven through a camserver connection.

use std::net::ToSocketAddrs;
use std::time::Duration;

use shared::geometry::Geometry;
use tracing::{debug, info};

use super::device::CamServerDevice;
use crate::controller::{CcdController, ControllerError, ControllerResult, ShutterState};

/// Extra time allowed for a bulk transfer beyond the command timeout.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// [`CcdController`] implementation for ARC (Leach) electronics.
pub struct ArcController {
    device: CamServerDevice,
    is_reset: bool,
}

impl ArcController {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ControllerResult<Self> {
        let device = CamServerDevice::connect(addr)?;
        Ok(Self::new(device))
    }

    pub fn new(device: CamServerDevice) -> Self {
        Self {
            device,
            is_reset: false,
        }
    }
}

impl CcdController for ArcController {
    fn controller_type(&self) -> &str {
        "arc"
    }

    fn reset(&mut self) -> ControllerResult<()> {
        self.is_reset = false;
        self.device.command("RESET")?;
        self.is_reset = true;
        info!("ARC controller reset");
        Ok(())
    }

    fn is_reset(&self) -> bool {
        self.is_reset
    }

    fn set_exposure_time(&mut self, seconds: f64) -> ControllerResult<()> {
        let millis = (seconds * 1000.0).round() as i64;
        self.device.command(&format!("SETEXPTIME {millis}"))
    }

    fn start_exposure(&mut self) -> ControllerResult<()> {
        self.device.command("STARTEXP")
    }

    fn exposure_time_remaining(&mut self) -> ControllerResult<f64> {
        self.device.query_f64("REMTIME")
    }

    fn exposure_abort(&mut self) -> ControllerResult<()> {
        self.device.command("ABORTEXP")
    }

    fn exposure_pause(&mut self) -> ControllerResult<()> {
        self.device.command("PAUSEEXP")
    }

    fn exposure_resume(&mut self) -> ControllerResult<()> {
        self.device.command("RESUMEEXP")
    }

    fn start_readout(&mut self) -> ControllerResult<()> {
        self.device.command("STARTREAD")
    }

    fn readout_abort(&mut self) -> ControllerResult<()> {
        self.device.command("ABORTREAD")
    }

    fn receive_image_data(&mut self, byte_count: usize) -> ControllerResult<Vec<u8>> {
        let values = self.device.query(&format!("READIMAGE {byte_count}"))?;
        let announced = CamServerDevice::parse_value(&values, 0)? as usize;
        if announced != byte_count {
            return Err(ControllerError::Transfer(format!(
                "camserver announced {announced} bytes, expected {byte_count}"
            )));
        }

        let command_timeout = self.device.timeout();
        self.device.set_timeout(TRANSFER_TIMEOUT);
        let data = self.device.read_bytes(byte_count);
        self.device.set_timeout(command_timeout);
        debug!("Received {byte_count} image bytes");
        data
    }

    fn pixels_remaining(&mut self) -> ControllerResult<usize> {
        Ok(self.device.query_f64("PIXCOUNT")?.max(0.0) as usize)
    }

    fn set_shutter_state(&mut self, state: ShutterState) -> ControllerResult<()> {
        let arg = match state {
            ShutterState::Open => "OPEN",
            ShutterState::Closed => "CLOSE",
        };
        self.device.command(&format!("SHUTTER {arg}"))
    }

    fn select_video_outputs(&mut self) -> ControllerResult<()> {
        self.device.command("SELECTVIDEO")
    }

    fn set_bias_lowered(&mut self, lowered: bool) -> ControllerResult<()> {
        // RMP 0 ramps the output drains down, RMP 1 restores them
        self.device.command(if lowered { "RMP 0" } else { "RMP 1" })
    }

    fn flush(&mut self) -> ControllerResult<()> {
        self.device.command("FLUSH")
    }

    fn stop_idle(&mut self) -> ControllerResult<()> {
        self.device.command("STOPIDLE")
    }

    fn parshift(&mut self, rows: i32) -> ControllerResult<()> {
        self.device.command(&format!("PARSHIFT {rows}"))
    }

    fn set_roi(&mut self, geometry: &Geometry) -> ControllerResult<()> {
        let f = &geometry.format;
        self.device.command(&format!(
            "SETFORMAT {} {} {} {} {} {} {} {} {}",
            f.ns_total,
            f.ns_predark,
            f.ns_underscan,
            f.ns_overscan,
            f.np_total,
            f.np_predark,
            f.np_underscan,
            f.np_overscan,
            f.np_frametransfer
        ))?;
        let r = &geometry.roi;
        self.device.command(&format!(
            "SETROI {} {} {} {} {} {}",
            r.first_col, r.last_col, r.first_row, r.last_row, r.col_bin, r.row_bin
        ))?;
        let p = &geometry.focal_plane;
        self.device.command(&format!(
            "SETAMPS {} {} {}",
            p.total_amps_x(),
            p.total_amps_y(),
            p.amp_config
        ))
    }

    fn set_video_gain(&mut self, gain: i32) -> ControllerResult<()> {
        self.device.command(&format!("SETGAIN {gain}"))
    }

    fn set_video_speed(&mut self, speed: i32) -> ControllerResult<()> {
        self.device.command(&format!("SETSPEED {speed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve canned replies, returning the command lines received.
    fn fake_camserver(replies: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                received.push(line.trim_end().to_string());
                writer.write_all(reply.as_bytes()).unwrap();
            }
            received
        });
        (addr, handle)
    }

    #[test]
    fn test_exposure_commands() {
        let (addr, server) = fake_camserver(vec!["OK\n", "OK\n", "OK 2.5\n", "OK\n"]);
        let mut arc = ArcController::connect(addr.as_str()).unwrap();
        arc.reset().unwrap();
        assert!(arc.is_reset());
        arc.set_exposure_time(3.0).unwrap();
        assert_eq!(arc.exposure_time_remaining().unwrap(), 2.5);
        arc.set_bias_lowered(true).unwrap();

        let received = server.join().unwrap();
        assert_eq!(received, vec!["RESET", "SETEXPTIME 3000", "REMTIME", "RMP 0"]);
    }

    #[test]
    fn test_busy_reply_is_transient() {
        let (addr, server) = fake_camserver(vec!["BUSY readout in progress\n"]);
        let mut arc = ArcController::connect(addr.as_str()).unwrap();
        let err = arc.set_exposure_time(1.0).unwrap_err();
        assert!(err.is_transient());
        server.join().unwrap();
    }

    #[test]
    fn test_receive_image_data() {
        let (addr, server) = fake_camserver(vec!["OK 4\n\x05\x00\x06\x00"]);
        let mut arc = ArcController::connect(addr.as_str()).unwrap();
        assert_eq!(arc.receive_image_data(4).unwrap(), vec![5, 0, 6, 0]);
        assert_eq!(server.join().unwrap(), vec!["READIMAGE 4"]);
    }
}
