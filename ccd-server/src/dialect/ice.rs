//! ICE tool commands, addressed as `ice.<verb>` or `ccdacq.<verb>`.
//!
//! Both tools share most verbs. Where they differ, `ccdacq` follows the
//! immediate-return acquisition client: the image type comes from the last
//! `set shutterstate`, `readexposure` reports elapsed time and the
//! focal plane is always a single amplifier. Replies are `OK` followed by
//! any returned values, or `ERROR <message>`.

use exposure::{
    ExposureFlag, ExposureResult, GuideLoopDriver, GuideOutcome, RemoteServerDescriptor,
    ServerDialect,
};
use hardware::ShutterState;
use shared::geometry::{DetectorFormat, FocalPlane, Roi};
use shared::header::KeywordValue;
use strum::{Display, EnumString};
use tracing::{debug, info};

use super::{arg, int_args, tokenize, CommandDialect};
use crate::camera::CameraHandle;

/// Port used by `setsocket` when none is given.
pub const DEFAULT_SOCKET_PORT: u16 = 6543;

/// OBJECT keyword of `ice.expose` images.
const ICE_TITLE: &str = "LBT Guider Image";
/// OBJECT keyword of `ccdacq.expose` images.
const CCDACQ_TITLE: &str = "ccdacq image";

type Reply = Result<Vec<String>, String>;

fn ok() -> Reply {
    Ok(Vec::new())
}

fn values<I, T>(items: I) -> Reply
where
    I: IntoIterator<Item = T>,
    T: ToString,
{
    Ok(items.into_iter().map(|v| v.to_string()).collect())
}

fn status<T, E: ToString>(result: Result<T, E>) -> Reply {
    result.map_err(|e| e.to_string()).and(ok())
}

/// Header values arrive as text; keep numbers numeric.
fn keyword_value(raw: &str) -> KeywordValue {
    if let Ok(i) = raw.parse::<i64>() {
        KeywordValue::Int(i)
    } else if let Ok(x) = raw.parse::<f64>() {
        KeywordValue::Float(x)
    } else {
        KeywordValue::Str(raw.to_string())
    }
}

/// Tool prefix of an ICE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IceTool {
    Ice,
    Ccdacq,
}

/// Command handler for the ICE tools.
pub struct IceDialect {
    camera: CameraHandle,
}

impl IceDialect {
    pub fn new(camera: CameraHandle) -> Self {
        Self { camera }
    }

    /// `expose` and `expose1`: fixed file name, then a full cycle.
    fn expose(&self, tool: IceTool, tokens: &[String], background: bool) -> Reply {
        let duration = arg::<f64>(tokens, 2)?;
        let filename = arg::<String>(tokens, 3)?;

        let (image_type, title) = self.camera.with_machine(|m| {
            let names = m.filename_mut();
            names.test_image = false;
            names.set_fixed_name(&filename);
            match tool {
                IceTool::Ice => ("object".to_string(), ICE_TITLE),
                IceTool::Ccdacq => (m.immediate_type().name().to_string(), CCDACQ_TITLE),
            }
        });

        if background {
            self.camera.spawn_exposure(duration, image_type, title.to_string());
            return ok();
        }
        status(self.camera.with_machine(|m| m.expose(duration, &image_type, title)))
    }

    fn guide(&self, tokens: &[String]) -> Reply {
        let count = match tokens.get(2) {
            Some(_) => arg::<i32>(tokens, 2)?,
            None => 1,
        };
        let driver = GuideLoopDriver::new(count);
        match self.camera.with_machine(|m| driver.run(m)) {
            GuideOutcome::Completed { exposures } => {
                info!("Guide loop completed {exposures} exposures");
                ok()
            }
            GuideOutcome::Aborted => ok(),
        }
    }

    fn readexposure(&self, tool: IceTool) -> Reply {
        let remaining = self
            .camera
            .exposure_time_remaining()
            .map_err(|e| e.to_string())?;
        let remaining_ms = (remaining * 1000.0) as i64;
        match tool {
            IceTool::Ice => values([remaining_ms]),
            IceTool::Ccdacq => {
                let exposure_ms = (self.camera.control().exposure_time() * 1000.0) as i64;
                values([exposure_ms - (remaining_ms - 3).max(0)])
            }
        }
    }

    fn get(&self, tool: IceTool, attribute: &str) -> Reply {
        let camera = &self.camera;
        match attribute {
            "version" => values([env!("CARGO_PKG_VERSION")]),
            "cameratype" => values([camera.with_machine(|m| m.controller_type().to_string())]),
            "servername" => values([camera.server_name()]),
            "vispixels" => self.detector_size(),
            "camtemp" => self.temperatures().map(|t| vec![t[0].clone()]),
            "dewtemp" => self.temperatures().map(|t| vec![t[1].clone()]),
            "pixelcount" => match tool {
                IceTool::Ice => values([camera.control().pixels_remaining()]),
                IceTool::Ccdacq => values([camera.control().pixels_transferred()]),
            },
            "utc-obs" => camera.with_machine(|m| {
                m.header()
                    .get("UTC-OBS")
                    .map(|k| vec![k.value.to_string()])
                    .ok_or_else(|| "UTC-OBS not set".to_string())
            }),
            _ => ok(),
        }
    }

    fn set(&self, tokens: &[String]) -> Reply {
        let attribute = arg::<String>(tokens, 1)?.to_ascii_lowercase();
        if attribute == "shutterstate" {
            let state = match arg::<String>(tokens, 2)?.to_ascii_lowercase().as_str() {
                "open" => ShutterState::Open,
                _ => ShutterState::Closed,
            };
            self.camera.with_machine(|m| m.set_immediate_shutter(state));
        }
        ok()
    }

    fn detector_size(&self) -> Reply {
        let size = self.camera.with_machine(|m| m.geometry().image_size());
        values([size.width, size.height])
    }

    fn temperatures(&self) -> Result<Vec<String>, String> {
        match self.camera.temperatures() {
            Some(Ok(temps)) => Ok(vec![temps.camera.to_string(), temps.dewar.to_string()]),
            Some(Err(e)) => Err(e.to_string()),
            None => Err("no temperature controller".to_string()),
        }
    }

    /// `setsocket <flag> <host> [port]`; a flag of -1 or an empty host
    /// disables delivery.
    fn setsocket(&self, tokens: &[String]) -> Reply {
        let flag = arg::<i32>(tokens, 1)?;
        let host = tokens.get(2).cloned().unwrap_or_default();
        if flag == -1 || host.is_empty() {
            self.camera.set_remote(None);
            self.camera.with_machine(|m| m.settings_mut().send_image = false);
            return ok();
        }
        let port = match tokens.get(3) {
            Some(_) => arg::<u16>(tokens, 3)?,
            None => DEFAULT_SOCKET_PORT,
        };
        let dialect = self
            .camera
            .remote()
            .map(|d| d.dialect)
            .unwrap_or(ServerDialect::Ccdacq);
        self.camera
            .set_remote(Some(RemoteServerDescriptor::new(&host, port, dialect)));
        self.camera.with_machine(|m| m.settings_mut().send_image = true);
        ok()
    }

    fn sendimage(&self, tokens: &[String]) -> Reply {
        let host = arg::<String>(tokens, 2)?;
        let port = arg::<u16>(tokens, 3)?;
        let descriptor = RemoteServerDescriptor::new(&host, port, ServerDialect::Ccdacq);
        self.camera.set_remote(Some(descriptor.clone()));
        self.camera.control().set_flag(ExposureFlag::None);
        status(self.camera.with_machine(|m| m.send_current_image(&descriptor)))
    }

    fn setparameter(&self, tokens: &[String]) -> Reply {
        let keyword = arg::<String>(tokens, 1)?;
        let value = keyword_value(&arg::<String>(tokens, 2)?);
        let comment = tokens.get(3).cloned().unwrap_or_default();
        self.camera.with_machine(|m| m.set_keyword(&keyword, value, &comment));
        ok()
    }

    fn dispatch(&self, tool: IceTool, verb: &str, tokens: &[String]) -> Option<Reply> {
        let camera = &self.camera;
        let reply = match verb {
            "expose" => self.expose(tool, tokens, false),
            "expose1" => self.expose(tool, tokens, true),
            "guide" => self.guide(tokens),
            "reset" | "resetcontroller" => status(camera.with_machine(|m| m.reset())),
            "abort" | "abortexposure" => status(camera.abort()),
            "pauseexposure" => status(camera.pause()),
            "resumeexposure" => status(camera.resume()),
            "cleararray" => status(camera.with_machine(|m| m.flush())),
            "parshift" => arg::<i32>(tokens, 1)
                .and_then(|rows| status(camera.with_machine(|m| m.parshift(rows)))),
            "getdetpars" => self.detector_size(),
            "get" => match tokens.get(1) {
                Some(attribute) => self.get(tool, &attribute.to_ascii_lowercase()),
                None => Err("missing argument 1".to_string()),
            },
            "set" => self.set(tokens),
            "setexposure" => arg::<f64>(tokens, 1).and_then(|millis| {
                status(camera.with_machine(|m| m.set_exposure_time(millis / 1000.0)))
            }),
            "readexposure" => self.readexposure(tool),
            "setroi" | "set_roi" => int_args::<6>(tokens, 1).and_then(|v| {
                let roi = Roi::from_values(v).map_err(|e| e.to_string())?;
                status(camera.with_machine(|m| m.set_roi(roi)))
            }),
            "setformat" => int_args::<9>(tokens, 1).and_then(|v| {
                let format = DetectorFormat::from_values(v).map_err(|e| e.to_string())?;
                status(camera.with_machine(|m| m.set_format(format)))
            }),
            // Arguments are accepted but the detector is read through one amp
            "setconfiguration" => {
                status(camera.with_machine(|m| m.set_focal_plane(FocalPlane::single_amp())))
            }
            "setgainspeed" => arg::<i32>(tokens, 1)
                .and_then(|gain| status(camera.with_machine(|m| m.set_gain_speed(gain, None)))),
            "getpixelcount" => values([camera.control().pixels_remaining()]),
            "gettemp" => self.temperatures().map(|t| vec![t[0].clone()]),
            "readtemperature" => self.temperatures(),
            "setsocket" => self.setsocket(tokens),
            "sendimage" => self.sendimage(tokens),
            "startexposure" => status(camera.with_machine(|m| {
                m.filename_mut().test_image = true;
                m.start_exposure_immediate()
            })),
            "readimage" => status(camera.with_machine(|m| -> ExposureResult<()> {
                m.readout_immediate()?;
                if m.flag() == ExposureFlag::Abort {
                    return Ok(());
                }
                m.end().map(|_| ())
            })),
            "setparameter" => self.setparameter(tokens),
            "closeconnection" | "setsyntheticimage" | "setmode" => {
                debug!("{tool}.{verb} accepted with no action");
                ok()
            }
            _ => return None,
        };
        Some(reply)
    }
}

impl CommandDialect for IceDialect {
    fn name(&self) -> &'static str {
        "ice"
    }

    fn handle(&self, line: &str) -> Option<String> {
        let tokens = tokenize(line);
        let (prefix, verb) = tokens.first()?.split_once('.')?;
        let tool: IceTool = prefix.parse().ok()?;
        let verb = verb.to_ascii_lowercase();
        let reply = self.dispatch(tool, &verb, &tokens)?;
        debug!("{tool}.{verb}: {reply:?}");

        Some(match reply {
            Ok(values) => std::iter::once("OK".to_string())
                .chain(values)
                .collect::<Vec<_>>()
                .join(" "),
            Err(message) => format!("ERROR {message}"),
        })
    }
}
