/* distrans - a lightweight relay fanning out conversion events to marketing APIs
 * Copyright (C) 2023 Withings
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>. */

use crate::logging;

use serde::Deserialize;
use std::net::IpAddr;
use std::fs::File;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use directories::ProjectDirs;
use serde_with::{DisplayFromStr, serde_as};
use byte_unit::Byte as ByteSize;
use flexi_logger::writers::SyslogFacility;
use serde_yaml;
use log;

/// Configuration defaults
pub mod defaults {
    use std::net::{IpAddr, Ipv4Addr};
    use byte_unit::Byte as ByteSize;
    use flexi_logger::writers::SyslogFacility;

    pub fn server_ip() -> IpAddr { IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)) }
    pub fn server_port() -> u16 { 8080 }
    pub fn server_payload_size_limit() -> ByteSize { ByteSize::from_u64(1024 * 1024) }

    pub fn logging_level() -> log::LevelFilter { log::LevelFilter::Info }
    pub fn syslog_port() -> u16 { 514 }
    pub fn syslog_protocol() -> String { String::from("udp") }
    pub fn syslog_facility() -> SyslogFacility { SyslogFacility::LocalUse0 }

    pub fn forwarder_timeout() -> humantime::Duration { crate::destinations::http::DEFAULT_TIMEOUT.into() }

    pub fn destinations() -> Vec<super::Destination> {
        ["facebook", "ga4", "google_ads"].iter()
            .map(|t| super::Destination { destination_type: t.to_string(), settings: super::Settings::new() })
            .collect()
    }
}

/// Server block
#[derive(Deserialize)]
pub struct Server {
    /// The IP we're going to bind to
    #[serde(default = "defaults::server_ip")]
    pub ip: IpAddr,
    /// The port we're going to listen on
    #[serde(default = "defaults::server_port")]
    pub port: u16,
    /// Inbound bodies larger than this are refused
    #[serde(default = "defaults::server_payload_size_limit")]
    pub payload_size_limit: ByteSize,
}

impl Default for Server {
    /// Builds a default server block in case none is provided
    fn default() -> Self {
        return Self {
            ip: defaults::server_ip(),
            port: defaults::server_port(),
            payload_size_limit: defaults::server_payload_size_limit(),
        }
    }
}

/// Syslog block, within the logging block
#[derive(Deserialize)]
pub struct Syslog {
    pub host: String,
    #[serde(default = "defaults::syslog_port")]
    pub port: u16,
    /// tcp or udp
    #[serde(default = "defaults::syslog_protocol")]
    pub protocol: String,
    #[serde(default = "defaults::syslog_facility", deserialize_with = "logging::parse_facility")]
    pub facility: SyslogFacility,
}

/// Logging block
#[derive(Deserialize)]
pub struct Logging {
    #[serde(default = "defaults::logging_level")]
    pub level: log::LevelFilter,
    /// Log to syslog instead of stdout
    #[serde(default)]
    pub syslog: Option<Syslog>,
}

impl Default for Logging {
    /// Builds a default logging block in case none is provided
    fn default() -> Self {
        return Self {
            level: defaults::logging_level(),
            syslog: None,
        }
    }
}

/// Forwarder block
#[serde_as]
#[derive(Deserialize)]
pub struct Forwarder {
    /// Bound on each outbound call, eg. "5s" or "1500ms"
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "defaults::forwarder_timeout")]
    pub timeout: humantime::Duration,
}

impl Default for Forwarder {
    /// Builds a default forwarder block in case none is provided
    fn default() -> Self {
        return Self {
            timeout: defaults::forwarder_timeout(),
        }
    }
}

/// Convenience type: arbitrary key-value settings (for destinations)
pub type Settings = HashMap<String, serde_yaml::Value>;

/// A single destination block
#[derive(Deserialize)]
pub struct Destination {
    /// The destination type
    #[serde(rename = "type")]
    pub destination_type: String,
    /// Some key-value settings specific to this destination
    #[serde(flatten)]
    pub settings: Settings,
}

/// The overall configuration file
#[derive(Deserialize)]
pub struct Configuration {
    /// A server block
    #[serde(default)]
    pub server: Server,
    /// A logging block
    #[serde(default)]
    pub logging: Logging,
    /// A forwarder block
    #[serde(default)]
    pub forwarder: Forwarder,
    /// And some destinations, all of them by default
    #[serde(default = "defaults::destinations")]
    pub destinations: Vec<Destination>,
}

impl Default for Configuration {
    fn default() -> Self {
        return Self {
            server: Server::default(),
            logging: Logging::default(),
            forwarder: Forwarder::default(),
            destinations: defaults::destinations(),
        }
    }
}

/// Parse a configuration file given a path
fn parse_configuration_file(path: &Path) -> Result<Configuration, String> {
    let path_str = path.display();
    let file = File::open(path).map_err(|e| format!("{}: {}", path_str, e))?;
    let configuration = serde_yaml::from_reader(file).map_err(|e| format!("{}: {}", path_str, e))?;
    Ok(configuration)
}

/// Locates and parses the configuration file
///
/// Without any file, the defaults apply and destinations take their
/// credentials from the environment.
pub fn get_configuration(cmd_arg: Option<&PathBuf>) -> Result<Configuration, String> {
    let given_location = cmd_arg
        .cloned()
        .or(std::env::var("DISTRANS_CONFIG").map(|s| PathBuf::from(s)).ok());

    /* If a path was given on the command line, ignore all other options */
    if let Some(path) = given_location {
        return parse_configuration_file(path.as_path());
    }

    /* Otherwise, try and guess */
    let xdg_dirs = ProjectDirs::from("com", "withings", "distrans");
    let inferred_locations = [
        Some(PathBuf::from("/etc/withings/distrans.yml")),
        Some(PathBuf::from("/etc/withings/distrans.yaml")),
        xdg_dirs.as_ref().map(|dirs| PathBuf::from(dirs.config_dir()).join("distrans.yml")),
        xdg_dirs.as_ref().map(|dirs| PathBuf::from(dirs.config_dir()).join("distrans.yaml")),
        std::env::current_dir().map(|p| p.join("distrans.yml")).ok(),
        std::env::current_dir().map(|p| p.join("distrans.yaml")).ok(),
    ];

    match inferred_locations.iter().flatten().find(|p| p.as_path().is_file()) {
        Some(path) => parse_configuration_file(path),
        None => Ok(Configuration::default()),
    }
}
