use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default)]
    pub format: Format,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
    /// Log every decoded packet at debug level.
    #[serde(default)]
    pub dump_packet: bool,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            format: Format::default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
            dump_packet: false,
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level(slog::Level::Info)
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/tmqtt".into()
    }
    #[inline]
    fn file_default() -> String {
        "tmqtt.log".into()
    }

    /// Full path of the log file, empty when no file is configured.
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        if self.dir.is_empty() {
            return self.file.clone();
        }
        format!("{}/{}", self.dir.trim_end_matches(['/', '\\']), self.file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(de::Error::unknown_variant(other, &["off", "file", "console", "both"])),
        }
    }
}

/// Line layout of log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Text,
    Json,
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(de::Error::unknown_variant(other, &["text", "json"])),
        }
    }
}

/// Log level as written in the settings (`debug`, `info`, `warn`, `error`, ...).
#[derive(Debug, Clone, Copy)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        let level = slog::Level::from_str(&level).map_err(|_| de::Error::custom(format!("bad level {level}")))?;
        Ok(Level(level))
    }
}
