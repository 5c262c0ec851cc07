use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::buttons::LONG_PRESS_MS;
use crate::encoder::{DEFAULT_MAX_STEP, DEFAULT_MIN_INTERVAL_MS};
use crate::error::ConfigError;

/// `b,pin,CMD[,resist,pressed,CMD_LONG,long_time]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonSpec {
    pub pin: u8,
    pub command: String,
    /// 0 off, 1 pull-down, 2 pull-up
    #[serde(default = "default_resist")]
    pub resist: u8,
    /// Level while the button is held, 0 or 1
    #[serde(default)]
    pub pressed: u8,
    #[serde(default)]
    pub long_command: Option<String>,
    #[serde(default = "default_long_press_ms")]
    pub long_press_ms: u64,
}

/// `e,pin1,pin2,CMD[,edge,min_interval_ms,max_step]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSpec {
    pub pin_a: u8,
    pub pin_b: u8,
    pub command: String,
    /// 1 falling, 2 rising, anything else both
    #[serde(default)]
    pub edge: u8,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_step")]
    pub max_step: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementSpec {
    Button(ButtonSpec),
    Encoder(EncoderSpec),
}

fn default_resist() -> u8 {
    2
}

fn default_long_press_ms() -> u64 {
    LONG_PRESS_MS
}

fn default_min_interval_ms() -> u64 {
    DEFAULT_MIN_INTERVAL_MS
}

fn default_max_step() -> u32 {
    DEFAULT_MAX_STEP
}

/// Optional field: missing or empty means the default.
fn field<T: FromStr>(spec: &str, name: &str, value: Option<&str>, default: T) -> Result<T, ConfigError> {
    match value.map(str::trim) {
        None | Some("") => Ok(default),
        Some(text) => text
            .parse()
            .map_err(|_| ConfigError::invalid(spec, format!("bad {name} '{text}'"))),
    }
}

fn pin(spec: &str, name: &str, value: Option<&str>) -> Result<u8, ConfigError> {
    match field(spec, name, value, 0u8)? {
        0 => Err(ConfigError::invalid(spec, format!("missing {name}"))),
        pin => Ok(pin),
    }
}

fn command(spec: &str, value: Option<&str>) -> Result<String, ConfigError> {
    match value.map(str::trim) {
        None | Some("") => Err(ConfigError::invalid(spec, "missing command")),
        Some(command) => Ok(command.to_string()),
    }
}

impl FromStr for ElementSpec {
    type Err = ConfigError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut fields = spec.split(',');
        match fields.next().map(str::trim) {
            Some("b") => {
                let pin = pin(spec, "pin", fields.next())?;
                let command = command(spec, fields.next())?;
                let resist = field(spec, "resist", fields.next(), default_resist())?;
                if resist > 2 {
                    return Err(ConfigError::invalid(spec, format!("bad resist '{resist}'")));
                }
                let pressed = field(spec, "pressed", fields.next(), 0u8)?;
                if pressed > 1 {
                    return Err(ConfigError::invalid(spec, format!("bad pressed level '{pressed}'")));
                }
                let long_command = fields
                    .next()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                let long_press_ms = field(spec, "long_time", fields.next(), default_long_press_ms())?;
                Ok(ElementSpec::Button(ButtonSpec {
                    pin,
                    command,
                    resist,
                    pressed,
                    long_command,
                    long_press_ms,
                }))
            }
            Some("e") => {
                let pin_a = pin(spec, "pin1", fields.next())?;
                let pin_b = pin(spec, "pin2", fields.next())?;
                if pin_a == pin_b {
                    return Err(ConfigError::invalid(spec, "both encoder pins are the same"));
                }
                let command = command(spec, fields.next())?;
                let edge = field(spec, "edge", fields.next(), 0u8)?;
                let min_interval_ms = field(spec, "min_interval_ms", fields.next(), default_min_interval_ms())?;
                let max_step = field(spec, "max_step", fields.next(), default_max_step())?;
                if max_step == 0 {
                    return Err(ConfigError::invalid(spec, "max_step must be at least 1"));
                }
                Ok(ElementSpec::Encoder(EncoderSpec {
                    pin_a,
                    pin_b,
                    command,
                    edge,
                    min_interval_ms,
                    max_step,
                }))
            }
            _ => Err(ConfigError::invalid(spec, "element type must be 'b' or 'e'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Everything the daemon needs to start. Filled from the optional JSON
/// settings file, then overridden from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub mac: Option<String>,
    pub command_file: Option<PathBuf>,
    pub elements: Vec<ElementSpec>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        info!(path = %path.display(), elements = settings.elements.len(), "Settings loaded");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn button_with_defaults() {
        let spec: ElementSpec = "b,17,PLAY".parse().unwrap();
        assert_eq!(
            spec,
            ElementSpec::Button(ButtonSpec {
                pin: 17,
                command: "PLAY".to_string(),
                resist: 2,
                pressed: 0,
                long_command: None,
                long_press_ms: 3000,
            })
        );
    }

    #[test]
    fn button_with_all_fields() {
        let spec: ElementSpec = "b,4,NEXT,1,1,SCRIPT:/usr/local/bin/off.sh,1500".parse().unwrap();
        let ElementSpec::Button(button) = spec else {
            panic!("expected a button");
        };
        assert_eq!(button.pin, 4);
        assert_eq!(button.resist, 1);
        assert_eq!(button.pressed, 1);
        assert_eq!(button.long_command.as_deref(), Some("SCRIPT:/usr/local/bin/off.sh"));
        assert_eq!(button.long_press_ms, 1500);
    }

    #[test]
    fn encoder_with_defaults_and_overrides() {
        let spec: ElementSpec = "e,22,27,VOLU".parse().unwrap();
        assert_eq!(
            spec,
            ElementSpec::Encoder(EncoderSpec {
                pin_a: 22,
                pin_b: 27,
                command: "VOLU".to_string(),
                edge: 0,
                min_interval_ms: 200,
                max_step: 10,
            })
        );

        let ElementSpec::Encoder(encoder) = "e,5,6,TRAC,2,500,1".parse().unwrap() else {
            panic!("expected an encoder");
        };
        assert_eq!(encoder.edge, 2);
        assert_eq!(encoder.min_interval_ms, 500);
        assert_eq!(encoder.max_step, 1);
    }

    #[test]
    fn malformed_elements_are_rejected() {
        for spec in [
            "",
            "x,1,PLAY",
            "b",
            "b,0,PLAY",
            "b,17",
            "b,abc,PLAY",
            "b,17,PLAY,7",
            "b,17,PLAY,2,3",
            "e,22,VOLU",
            "e,22,22,VOLU",
            "e,22,27,VOLU,0,100,0",
        ] {
            assert!(
                matches!(spec.parse::<ElementSpec>(), Err(ConfigError::InvalidElement { .. })),
                "{spec:?} should be rejected"
            );
        }
    }

    #[test]
    fn settings_file_uses_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server": {{ "host": "192.168.1.10" }},
                "elements": [
                    {{ "type": "button", "pin": 17, "command": "PLAY" }},
                    {{ "type": "encoder", "pin_a": 22, "pin_b": 27, "command": "VOLU", "max_step": 5 }}
                ]
            }}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.server.host.as_deref(), Some("192.168.1.10"));
        assert_eq!(settings.server.port, None);
        assert_eq!(settings.elements[0], "b,17,PLAY".parse().unwrap());
        assert_eq!(settings.elements[1], "e,22,27,VOLU,0,200,5".parse().unwrap());
    }

    #[test]
    fn broken_settings_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(Settings::load(file.path()), Err(ConfigError::Settings(_))));
        assert!(matches!(Settings::load(Path::new("/nonexistent/sbpd.json")), Err(ConfigError::Io(_))));
    }
}
