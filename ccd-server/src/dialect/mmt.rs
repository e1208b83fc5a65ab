//! MMT ccdacq command syntax.
//!
//! Bare verbs, case-insensitive, with space-separated arguments. Replies are a
//! single line of space-joined tokens starting with `OK` or `ERROR`:
//!
//! ```text
//! get camtemp          -> OK -110.123
//! setexposure 1500     -> OK
//! readexposure         -> OK 750
//! parshift x           -> ERROR invalid argument 1: x
//! ```

use exposure::{truncate3, ExposureFlag, RemoteServerDescriptor, ServerDialect};
use hardware::ShutterState;
use shared::geometry::{DetectorFormat, FocalPlane, Roi};
use tracing::debug;

use super::{arg, int_args, tokenize, CommandDialect};
use crate::camera::CameraHandle;

type Reply = Result<Vec<String>, String>;

fn ok() -> Reply {
    Ok(Vec::new())
}

fn ok_value(value: impl ToString) -> Reply {
    Ok(vec![value.to_string()])
}

/// Command handler for the MMT dialect.
pub struct MmtDialect {
    camera: CameraHandle,
}

impl MmtDialect {
    pub fn new(camera: CameraHandle) -> Self {
        Self { camera }
    }

    fn get(&self, attribute: &str) -> Option<Reply> {
        let reply = match attribute {
            "pixelcount" => ok_value(self.camera.control().pixels_transferred()),
            "camtemp" | "dewtemp" => match self.camera.temperatures() {
                Some(Ok(temps)) => {
                    let value = if attribute == "camtemp" {
                        temps.camera
                    } else {
                        temps.dewar
                    };
                    ok_value(truncate3(value))
                }
                Some(Err(e)) => Err(e.to_string()),
                None => Err("no temperature controller".to_string()),
            },
            "utc-obs" => self.camera.with_machine(|m| {
                m.header()
                    .get("UTC-OBS")
                    .map(|k| vec![k.value.to_string()])
                    .ok_or_else(|| "UTC-OBS not set".to_string())
            }),
            _ => return None,
        };
        Some(reply)
    }

    fn set(&self, tokens: &[String]) -> Option<Reply> {
        let attribute = tokens.get(1)?.to_ascii_lowercase();
        let reply = match attribute.as_str() {
            // Readout mode is always "wait" here
            "readoutmode" => ok(),
            "shutterstate" => {
                let state = match tokens.get(2).map(|s| s.to_ascii_lowercase()) {
                    Some(s) if s == "open" => ShutterState::Open,
                    _ => ShutterState::Closed,
                };
                self.camera.with_machine(|m| m.set_immediate_shutter(state));
                ok()
            }
            _ => return None,
        };
        Some(reply)
    }

    fn dispatch(&self, verb: &str, tokens: &[String]) -> Option<Reply> {
        let camera = &self.camera;
        let reply = match verb {
            "reset" => camera
                .with_machine(|m| m.reset())
                .map_err(|e| e.to_string())
                .and(ok()),
            "abortexposure" => camera.abort().map_err(|e| e.to_string()).and(ok()),
            "pauseexposure" => camera.pause().map_err(|e| e.to_string()).and(ok()),
            "resumeexposure" => camera.resume().map_err(|e| e.to_string()).and(ok()),
            "get" => return self.get(&tokens.get(1)?.to_ascii_lowercase()),
            "set" => return self.set(tokens),
            "parshift" => arg::<i32>(tokens, 1).and_then(|rows| {
                camera
                    .with_machine(|m| m.parshift(rows))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            "setroi" => int_args::<6>(tokens, 1).and_then(|values| {
                let roi = Roi::from_values(values).map_err(|e| e.to_string())?;
                camera
                    .with_machine(|m| m.set_roi(roi))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            "setformat" => int_args::<9>(tokens, 1).and_then(|values| {
                let format = DetectorFormat::from_values(values).map_err(|e| e.to_string())?;
                camera
                    .with_machine(|m| m.set_format(format))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            // setconfiguration <flag> <splits> <numdetx> <numdety> <ampconfig>
            "setconfiguration" => arg::<String>(tokens, 5).and_then(|amp_config| {
                let plane = FocalPlane::new(1, 1, amp_config.len().max(1), 1, &amp_config)
                    .map_err(|e| e.to_string())?;
                camera
                    .with_machine(|m| m.set_focal_plane(plane))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            "setgainspeed" => int_args::<2>(tokens, 1).and_then(|[gain, speed]| {
                camera
                    .with_machine(|m| m.set_gain_speed(gain as i32, Some(speed as i32)))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            "setexposure" => arg::<f64>(tokens, 1).and_then(|millis| {
                camera
                    .with_machine(|m| m.set_exposure_time(millis / 1000.0))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            // Remaining time in milliseconds
            "readexposure" => camera
                .exposure_time_remaining()
                .map_err(|e| e.to_string())
                .and_then(|remaining| ok_value((remaining * 1000.0) as i64)),
            "cleararray" => camera
                .with_machine(|m| m.flush())
                .map_err(|e| e.to_string())
                .and(ok()),
            "startexposure" => camera
                .with_machine(|m| m.start_exposure_immediate())
                .map_err(|e| e.to_string())
                .and(ok()),
            "readimage" => camera
                .with_machine(|m| m.readout_immediate())
                .map_err(|e| e.to_string())
                .and(ok()),
            // sendimage <flag> <host> <port>
            "sendimage" => arg::<String>(tokens, 2).and_then(|host| {
                let port = arg::<u16>(tokens, 3)?;
                let descriptor = RemoteServerDescriptor::new(&host, port, ServerDialect::Ccdacq);
                camera.control().set_flag(ExposureFlag::None);
                camera
                    .with_machine(|m| m.send_current_image(&descriptor))
                    .map_err(|e| e.to_string())
                    .and(ok())
            }),
            "closeconnection" => ok(),
            _ => return None,
        };
        Some(reply)
    }
}

impl CommandDialect for MmtDialect {
    fn name(&self) -> &'static str {
        "mmt"
    }

    fn handle(&self, line: &str) -> Option<String> {
        // Method-call syntax belongs to the tool dispatcher
        if line.trim_end().ends_with(')') {
            return None;
        }
        let tokens = tokenize(line);
        let verb = tokens.first()?.to_ascii_lowercase();
        let reply = self.dispatch(&verb, &tokens)?;
        debug!("mmt {verb}: {reply:?}");

        Some(match reply {
            Ok(values) => std::iter::once("OK".to_string())
                .chain(values)
                .collect::<Vec<_>>()
                .join(" "),
            Err(message) => format!("ERROR {message}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::demo_camera;
    use exposure::ImageType;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    fn handle(dialect: &MmtDialect, line: &str) -> String {
        dialect.handle(line).expect("command should be handled")
    }

    #[test]
    fn test_unhandled_lines() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, _sim) = demo_camera(temp_dir.path());
        let mmt = MmtDialect::new(camera);

        assert!(mmt.handle("exposure.expose(1.0)").is_none());
        assert!(mmt.handle("frobnicate 1").is_none());
        assert!(mmt.handle("get nothing").is_none());
        assert!(mmt.handle("").is_none());
    }

    #[test]
    fn test_temperatures_and_errors() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, _sim) = demo_camera(temp_dir.path());
        let mmt = MmtDialect::new(camera);

        assert_eq!(handle(&mmt, "Get CamTemp"), "OK -110");
        assert_eq!(handle(&mmt, "get dewtemp"), "OK -180");
        assert_eq!(handle(&mmt, "parshift x"), "ERROR invalid argument 1: x");
        assert_eq!(handle(&mmt, "setroi 1 2 3"), "ERROR missing argument 4");
        assert!(handle(&mmt, "get utc-obs").starts_with("ERROR"));
    }

    #[test]
    fn test_configuration_verbs() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, sim) = demo_camera(temp_dir.path());
        let mmt = MmtDialect::new(camera.clone());

        assert_eq!(handle(&mmt, "setexposure 1500"), "OK");
        assert_eq!(sim.exposure_time(), 1.5);
        assert_eq!(handle(&mmt, "setgainspeed 2 1"), "OK");
        assert_eq!(sim.gain_speed(), (2, 1));
        assert_eq!(handle(&mmt, "parshift 10"), "OK");
        assert_eq!(sim.count("parshift_10"), 1);
        assert_eq!(handle(&mmt, "set readoutmode wait"), "OK");

        assert_eq!(handle(&mmt, "setroi 1 4 1 2 1 1"), "OK");
        assert_eq!(camera.lock().geometry().image_size().width, 4);
        assert_eq!(handle(&mmt, "setformat 8 0 0 0 4 0 0 0 0"), "OK");
        assert_eq!(camera.lock().geometry().image_size().width, 8);
        assert_eq!(handle(&mmt, "setconfiguration 0 1 1 1 01"), "OK");
        assert_eq!(camera.lock().geometry().num_amps(), 2);
        assert!(handle(&mmt, "setroi 1 99 1 4 1 1").starts_with("ERROR"));
    }

    #[test]
    fn test_shutterstate_selects_image_type() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, _sim) = demo_camera(temp_dir.path());
        let mmt = MmtDialect::new(camera.clone());

        assert_eq!(handle(&mmt, "set shutterstate open"), "OK");
        assert_eq!(camera.lock().immediate_type(), &ImageType::Object);
        assert_eq!(handle(&mmt, "set shutterstate close"), "OK");
        assert_eq!(camera.lock().immediate_type(), &ImageType::Dark);
    }

    #[test]
    fn test_immediate_exposure_and_send() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, sim) = demo_camera(temp_dir.path());
        let mmt = MmtDialect::new(camera.clone());

        assert_eq!(handle(&mmt, "setexposure 0"), "OK");
        assert_eq!(handle(&mmt, "startexposure 0"), "OK");
        assert_eq!(sim.count("start_exposure"), 1);
        assert_eq!(handle(&mmt, "readexposure"), "OK 0");
        assert_eq!(handle(&mmt, "readimage 0"), "OK");
        assert!(camera.lock().image().is_valid());
        assert_eq!(handle(&mmt, "get pixelcount"), "OK 32");

        let text = b"8 4\r\nNoFilename NoImageType\r\n";
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = vec![0u8; text.len() + 8 * 4 * 2];
            stream.read_exact(&mut received).unwrap();
            stream.write_all(b"1").unwrap();
            received
        });

        assert_eq!(handle(&mmt, &format!("sendimage 3 127.0.0.1 {port}")), "OK");
        let received = server.join().unwrap();
        assert!(received.starts_with(text));
        assert_eq!(handle(&mmt, "closeconnection"), "OK");
    }
}
