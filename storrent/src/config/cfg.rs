use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the config file information, previously created
/// with `Cfg::new`.
///
/// - `tcp_port`: port to listen on for incoming peers (1024-49151),
/// - `download_directory`: directory where the downloaded file is stored,
/// - `pipelining_size`: number of block requests kept in flight per peer,
/// - `max_peers_per_torrent`: maximum number of simultaneous peers,
/// - `seed_on_complete`: keep serving pieces after the download finishes
///   instead of exiting,
/// - `unchoke_slots`: reciprocation slots used by the choking loop,
/// - `unchoke_all_interested`: unchoke every interested peer instead of the
///   top `unchoke_slots` by rate (legacy swarm behaviour).
#[derive(Debug, Clone)]
pub struct Cfg {
    pub tcp_port: u16,
    pub download_directory: String,
    pub pipelining_size: u32,
    pub max_peers_per_torrent: u32,
    pub seed_on_complete: bool,
    pub unchoke_slots: usize,
    pub unchoke_all_interested: bool,
}

impl Cfg {
    /// Builds a Cfg struct from the config file at the given path.
    /// The format of the config file must be: {config_name}={config_value}
    /// (without brackets), one setting per line.
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be read.
    /// - A line is not in the KEY=VALUE shape or names an unknown setting.
    /// - A numeric or boolean setting fails to parse.
    /// - The minimum number of settings was not reached.
    /// - The tcp_port is outside the 1024-49151 range.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self {
            tcp_port: 0,
            download_directory: String::new(),
            pipelining_size: 0,
            max_peers_per_torrent: constants::DEFAULT_MAX_PEERS_PER_TORRENT,
            seed_on_complete: false,
            unchoke_slots: constants::DEFAULT_UNCHOKE_SLOTS,
            unchoke_all_interested: false,
        };

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut settings_loaded = 0;

        for line in reader.lines() {
            let current_line = line?;
            if current_line.trim().is_empty() {
                continue;
            }
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = Self::load_setting(cfg, setting[0], setting[1])?;
            settings_loaded += 1;
        }
        if settings_loaded < constants::MIN_SETTINGS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Minimum number of correct settings were not reached: {}",
                    settings_loaded
                ),
            ));
        }
        if cfg.tcp_port < constants::MIN_TCP_PORT || cfg.tcp_port > constants::MAX_TCP_PORT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} must be between {} and {}, got: {}",
                    constants::TCP_PORT,
                    constants::MIN_TCP_PORT,
                    constants::MAX_TCP_PORT,
                    cfg.tcp_port
                ),
            ));
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::TCP_PORT => {
                self.tcp_port = self.parse_value(value, constants::TCP_PORT)?;
            }
            constants::DOWNLOAD_DIRECTORY => self.download_directory = String::from(value),

            constants::PIPELINING_SIZE => {
                self.pipelining_size = self.parse_value(value, constants::PIPELINING_SIZE)?;
            }

            constants::MAX_PEERS_PER_TORRENT => {
                self.max_peers_per_torrent =
                    self.parse_value(value, constants::MAX_PEERS_PER_TORRENT)?;
            }

            constants::SEED_ON_COMPLETE => {
                self.seed_on_complete = self.parse_value(value, constants::SEED_ON_COMPLETE)?;
            }

            constants::UNCHOKE_SLOTS => {
                self.unchoke_slots = self.parse_value(value, constants::UNCHOKE_SLOTS)?;
            }

            constants::UNCHOKE_ALL_INTERESTED => {
                self.unchoke_all_interested =
                    self.parse_value(value, constants::UNCHOKE_ALL_INTERESTED)?;
            }

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        match value.parse::<F>() {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parsed) => Ok(parsed),
        }
    }
}
