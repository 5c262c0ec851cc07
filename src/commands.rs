use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Prefix marking a command spec as a script path instead of a command code.
pub const SCRIPT_PREFIX: &str = "SCRIPT:";

/// Command codes are exactly this many characters long.
pub const CODE_LEN: usize = 4;

const DEFAULT_COMMANDS: [(&str, &str); 6] = [
    ("PLAY", r#"["pause"]"#),
    ("VOL+", r#"["button","volup"]"#),
    ("VOL-", r#"["button","voldown"]"#),
    ("PREV", r#"["button","rew"]"#),
    ("NEXT", r#"["button","fwd"]"#),
    ("POWR", r#"["button","power"]"#),
];

/// What to do when a control fires. Resolved once at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBinding {
    /// JSON array handed verbatim to the command transport.
    ProtocolFragment(String),
    /// Executable run instead of talking to the server.
    ExternalScript(PathBuf),
}

/// Encoder command families. The sign and magnitude are filled in per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCommand {
    Volume,
    Track,
}

impl EncoderCommand {
    pub fn from_code(code: &str) -> Result<Self, ConfigError> {
        match code {
            "VOLU" => Ok(EncoderCommand::Volume),
            "TRAC" => Ok(EncoderCommand::Track),
            other => Err(ConfigError::UnknownCommand(other.to_string())),
        }
    }

    pub fn fragment(self, delta: i64) -> String {
        let sign = if delta < 0 { '-' } else { '+' };
        let magnitude = delta.unsigned_abs();
        match self {
            EncoderCommand::Volume => format!(r#"["mixer","volume","{sign}{magnitude}"]"#),
            EncoderCommand::Track => format!(r#"["playlist","index","{sign}{magnitude}"]"#),
        }
    }
}

/// Maps four-character command codes to protocol fragments.
#[derive(Debug, Clone, Default)]
pub struct CommandMapper {
    fragments: HashMap<String, String>,
}

impl CommandMapper {
    pub fn empty() -> Self {
        CommandMapper::default()
    }

    pub fn builtin() -> Self {
        let mut mapper = CommandMapper::empty();
        for (code, fragment) in DEFAULT_COMMANDS {
            mapper.insert(code, fragment);
        }
        mapper
    }

    /// Loads a `CODE=fragment` file, falling back to the built-in set when
    /// no file is given or it cannot be read.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("Using builtin button configuration");
            return CommandMapper::builtin();
        };
        match fs::read_to_string(path) {
            Ok(text) => {
                info!(path = %path.display(), "Loading command configuration");
                CommandMapper::parse(&text)
            }
            Err(e) => {
                warn!(path = %path.display(), "Command file not readable ({}), using builtin configuration", e);
                CommandMapper::builtin()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut mapper = CommandMapper::empty();
        for line in text.lines() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if name.chars().count() != CODE_LEN || value.is_empty() {
                warn!(line, "Invalid or missing command in config file");
                continue;
            }
            info!(name, value, "Command defined");
            mapper.insert(name, value);
        }
        mapper
    }

    pub fn insert(&mut self, code: &str, fragment: &str) {
        self.fragments.insert(code.to_string(), fragment.to_string());
    }

    pub fn fragment(&self, code: &str) -> Option<&str> {
        self.fragments.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Turns a configured command spec into a binding.
    pub fn resolve(&self, spec: &str) -> Result<CommandBinding, ConfigError> {
        if let Some(path) = spec.strip_prefix(SCRIPT_PREFIX) {
            if path.is_empty() {
                return Err(ConfigError::invalid(spec, "empty script path"));
            }
            return Ok(CommandBinding::ExternalScript(PathBuf::from(path)));
        }
        self.fragment(spec)
            .map(|fragment| CommandBinding::ProtocolFragment(fragment.to_string()))
            .ok_or_else(|| ConfigError::UnknownCommand(spec.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_table_has_transport_commands() {
        let mapper = CommandMapper::builtin();
        assert_eq!(mapper.len(), 6);
        assert_eq!(mapper.fragment("PLAY"), Some(r#"["pause"]"#));
        assert_eq!(mapper.fragment("POWR"), Some(r#"["button","power"]"#));
    }

    #[test]
    fn resolves_fragment_and_script() {
        let mapper = CommandMapper::builtin();
        assert_eq!(
            mapper.resolve("NEXT").unwrap(),
            CommandBinding::ProtocolFragment(r#"["button","fwd"]"#.to_string())
        );
        assert_eq!(
            mapper.resolve("SCRIPT:/tmp/x.sh").unwrap(),
            CommandBinding::ExternalScript(PathBuf::from("/tmp/x.sh"))
        );
    }

    #[test]
    fn unknown_code_is_an_error() {
        let mapper = CommandMapper::builtin();
        assert!(matches!(mapper.resolve("FOOO"), Err(ConfigError::UnknownCommand(code)) if code == "FOOO"));
        assert!(mapper.resolve("SCRIPT:").is_err());
    }

    #[test]
    fn parses_command_file() {
        let text = "# custom buttons\n\nSHUF=[\"playlist\",\"shuffle\"]  \nTOOLONG=[\"x\"]\nnoequals\nPLAY=[\"play\"]\n";
        let mapper = CommandMapper::parse(text);
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.fragment("SHUF"), Some(r#"["playlist","shuffle"]"#));
        assert_eq!(mapper.fragment("PLAY"), Some(r#"["play"]"#));
        assert_eq!(mapper.fragment("VOL+"), None);
    }

    #[test]
    fn load_reads_file_or_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MUTE=[\"mixer\",\"muting\"]").unwrap();
        let mapper = CommandMapper::load(Some(file.path()));
        assert_eq!(mapper.fragment("MUTE"), Some(r#"["mixer","muting"]"#));
        assert_eq!(mapper.fragment("PLAY"), None);

        let fallback = CommandMapper::load(Some(Path::new("/nonexistent/sbpd_commands.cfg")));
        assert_eq!(fallback.fragment("PLAY"), Some(r#"["pause"]"#));
    }

    #[test]
    fn encoder_fragments_carry_sign_and_magnitude() {
        assert_eq!(EncoderCommand::Volume.fragment(3), r#"["mixer","volume","+3"]"#);
        assert_eq!(EncoderCommand::Volume.fragment(-5), r#"["mixer","volume","-5"]"#);
        assert_eq!(EncoderCommand::Track.fragment(-1), r#"["playlist","index","-1"]"#);
        assert!(EncoderCommand::from_code("BASS").is_err());
    }
}
