//! Immutable process configuration.
//!
//! CLI flags and the `key value` text file are parsed into one [`Config`]
//! at startup and handed out by reference; only the RSSI thresholds are
//! live-mutable, and that lives on [`crate::monitor::AdvertisementMonitor`]
//! which owns them.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::{Parser, ValueEnum};

use crate::error::Error;

/// Which [`crate::buffer::Buffer`] implementation to pace audio delivery
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum BufferAlgorithm {
    None,
    Threaded,
    Poll4,
    Poll8,
    Timed,
}

impl Default for BufferAlgorithm {
    fn default() -> Self {
        BufferAlgorithm::Threaded
    }
}

/// Command-line flags accepted by the daemon.
#[derive(Debug, Parser)]
#[command(name = "asha", about = "ASHA audio sink for Linux over BlueZ")]
pub struct Args {
    /// Buffering/pacing strategy used to deliver 20ms frames to each side.
    #[arg(long, value_enum, default_value_t = BufferAlgorithm::Threaded)]
    pub buffer_algorithm: BufferAlgorithm,

    /// Stream volume for both sides, -128 (muted) to 0.
    #[arg(long)]
    pub volume: Option<i8>,
    /// Stream volume for left-labelled sides only.
    #[arg(long)]
    pub left_volume: Option<i8>,
    /// Stream volume for right-labelled sides only.
    #[arg(long)]
    pub right_volume: Option<i8>,

    /// LE connection interval, units of 1.25ms, range [6, 16].
    #[arg(long, default_value_t = 16)]
    pub interval: u16,
    /// Supervision timeout, units of 10ms, range [10, 3200].
    #[arg(long, default_value_t = 100)]
    pub timeout: u16,
    /// Connection event length, units of 0.625ms, range [0, 65535].
    #[arg(long, default_value_t = 12)]
    pub celength: u16,

    /// Request the 1M PHY in addition to the default.
    #[arg(long, default_value_t = false)]
    pub phy1m: bool,
    /// Request the 2M PHY (recommended; better battery life on the peripheral).
    #[arg(long, default_value_t = false)]
    pub phy2m: bool,
    /// Register a GATT profile + advertisement monitor for BlueZ-driven
    /// proximity auto-reconnect.
    #[arg(long, default_value_t = false)]
    pub reconnect: bool,

    /// RSSI threshold (dBm) that triggers `Connect` on a paired peer. 0 disables.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub rssi_paired: i16,
    /// RSSI threshold (dBm) that triggers `Pair` on an unpaired peer. 0 disables.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub rssi_unpaired: i16,

    /// Path to a persisted `key value` config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Fully resolved, immutable configuration used by the rest of the crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub buffer_algorithm: BufferAlgorithm,
    pub left_volume: i8,
    pub right_volume: i8,
    pub interval: u16,
    pub timeout: u16,
    pub celength: u16,
    pub phy1m: bool,
    pub phy2m: bool,
    pub reconnect: bool,
    pub rssi_paired: i16,
    pub rssi_unpaired: i16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buffer_algorithm: BufferAlgorithm::default(),
            left_volume: -64,
            right_volume: -64,
            interval: 16,
            timeout: 100,
            celength: 12,
            phy1m: false,
            phy2m: false,
            reconnect: false,
            rssi_paired: 0,
            rssi_unpaired: 0,
        }
    }
}

fn check_range(key: &str, value: i64, min: i64, max: i64) -> Result<(), Error> {
    if value < min || value > max {
        Err(Error::ConfigInvalid(format!(
            "{key} must be between {min} and {max}, got {value}"
        )))
    } else {
        Ok(())
    }
}

impl Config {
    /// Build a [`Config`] from parsed CLI args, optionally overlaying a
    /// persisted config file first (CLI flags take precedence, matching the
    /// original's "config file sets defaults, argv overrides" ordering in
    /// `Config::ReadArgs`).
    pub fn from_args(args: &Args) -> Result<Self, Error> {
        let mut cfg = if let Some(path) = &args.config {
            Config::read_file(path)?
        } else {
            Config::default()
        };

        if let Some(v) = args.volume {
            check_range("volume", v as i64, -128, 0)?;
            cfg.left_volume = v;
            cfg.right_volume = v;
        }
        if let Some(v) = args.left_volume {
            check_range("left_volume", v as i64, -128, 0)?;
            cfg.left_volume = v;
        }
        if let Some(v) = args.right_volume {
            check_range("right_volume", v as i64, -128, 0)?;
            cfg.right_volume = v;
        }
        check_range("interval", args.interval as i64, 6, 16)?;
        check_range("timeout", args.timeout as i64, 10, 3200)?;
        check_range("celength", args.celength as i64, 0, 65535)?;
        check_range("rssi_paired", args.rssi_paired as i64, -127, 0)?;
        check_range("rssi_unpaired", args.rssi_unpaired as i64, -127, 0)?;

        cfg.buffer_algorithm = args.buffer_algorithm;
        cfg.interval = args.interval;
        cfg.timeout = args.timeout;
        cfg.celength = args.celength;
        cfg.phy1m = args.phy1m;
        cfg.phy2m = args.phy2m;
        cfg.reconnect = args.reconnect;
        cfg.rssi_paired = args.rssi_paired;
        cfg.rssi_unpaired = args.rssi_unpaired;

        Ok(cfg)
    }

    /// Parse a persisted `key value`-per-line text file. Unknown keys are
    /// rejected rather than silently ignored.
    pub fn read_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, Error> {
        let mut cfg = Config::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();
            cfg.set(key, value).map_err(|e| match e {
                Error::ConfigInvalid(msg) => {
                    Error::ConfigInvalid(format!("line {}: {msg}", lineno + 1))
                }
                other => other,
            })?;
        }
        Ok(cfg)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
            value
                .parse()
                .map_err(|_| Error::ConfigInvalid(format!("{key}: not an integer: {value:?}")))
        }
        fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
            match value {
                "" | "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(Error::ConfigInvalid(format!(
                    "{key}: not a boolean: {value:?}"
                ))),
            }
        }

        match key {
            "buffer_algorithm" => {
                self.buffer_algorithm = match value {
                    "none" => BufferAlgorithm::None,
                    "threaded" => BufferAlgorithm::Threaded,
                    "poll4" => BufferAlgorithm::Poll4,
                    "poll8" => BufferAlgorithm::Poll8,
                    "timed" => BufferAlgorithm::Timed,
                    _ => {
                        return Err(Error::ConfigInvalid(format!(
                            "buffer_algorithm: unknown value {value:?}"
                        )))
                    }
                };
            }
            "volume" => {
                let v: i8 = parse_int(key, value)?;
                check_range(key, v as i64, -128, 0)?;
                self.left_volume = v;
                self.right_volume = v;
            }
            "left_volume" => {
                let v: i8 = parse_int(key, value)?;
                check_range(key, v as i64, -128, 0)?;
                self.left_volume = v;
            }
            "right_volume" => {
                let v: i8 = parse_int(key, value)?;
                check_range(key, v as i64, -128, 0)?;
                self.right_volume = v;
            }
            "interval" => {
                self.interval = parse_int(key, value)?;
                check_range(key, self.interval as i64, 6, 16)?;
            }
            "timeout" => {
                self.timeout = parse_int(key, value)?;
                check_range(key, self.timeout as i64, 10, 3200)?;
            }
            "celength" => {
                self.celength = parse_int(key, value)?;
                check_range(key, self.celength as i64, 0, 65535)?;
            }
            "phy1m" => self.phy1m = parse_bool(key, value)?,
            "phy2m" => self.phy2m = parse_bool(key, value)?,
            "reconnect" => self.reconnect = parse_bool(key, value)?,
            "rssi_paired" => {
                self.rssi_paired = parse_int(key, value)?;
                check_range(key, self.rssi_paired as i64, -127, 0)?;
            }
            "rssi_unpaired" => {
                self.rssi_unpaired = parse_int(key, value)?;
                check_range(key, self.rssi_unpaired as i64, -127, 0)?;
            }
            other => {
                return Err(Error::ConfigInvalid(format!("unknown config key {other:?}")))
            }
        }
        Ok(())
    }

    /// Serialize back to the `key value`-per-line persisted format.
    pub fn write(&self) -> String {
        let algo = match self.buffer_algorithm {
            BufferAlgorithm::None => "none",
            BufferAlgorithm::Threaded => "threaded",
            BufferAlgorithm::Poll4 => "poll4",
            BufferAlgorithm::Poll8 => "poll8",
            BufferAlgorithm::Timed => "timed",
        };
        let mut out = String::new();
        out.push_str(&format!("buffer_algorithm {algo}\n"));
        out.push_str(&format!("left_volume {}\n", self.left_volume));
        out.push_str(&format!("right_volume {}\n", self.right_volume));
        out.push_str(&format!("interval {}\n", self.interval));
        out.push_str(&format!("timeout {}\n", self.timeout));
        out.push_str(&format!("celength {}\n", self.celength));
        if self.phy2m {
            out.push_str("phy2m\n");
        }
        if self.phy1m {
            out.push_str("phy1m\n");
        }
        if self.reconnect {
            out.push_str("reconnect\n");
        }
        out.push_str(&format!("rssi_paired {}\n", self.rssi_paired));
        out.push_str(&format!("rssi_unpaired {}\n", self.rssi_unpaired));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_config_cxx() {
        let cfg = Config::default();
        assert_eq!(cfg.left_volume, -64);
        assert_eq!(cfg.interval, 16);
        assert_eq!(cfg.timeout, 100);
        assert_eq!(cfg.celength, 12);
        assert_eq!(cfg.buffer_algorithm, BufferAlgorithm::Threaded);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = Config::parse("bogus_key 1\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn out_of_range_value_is_an_error() {
        let err = Config::parse("interval 20\n").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn round_trips_through_write_and_parse() {
        let mut cfg = Config::default();
        cfg.phy2m = true;
        cfg.rssi_paired = -70;
        let text = cfg.write();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn parses_boolean_flags_without_value() {
        let cfg = Config::parse("phy2m\nreconnect\n").unwrap();
        assert!(cfg.phy2m);
        assert!(cfg.reconnect);
    }
}
