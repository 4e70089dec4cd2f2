/// A parsed announce url: scheme, host, port and endpoint path.
///
/// To create a new `TrackerUrl` use the method builder `parse()`.
#[derive(Debug, PartialEq, Clone)]
pub struct TrackerUrl {
    pub protocol: ConnectionProtocol,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

/// Announce schemes this client can speak.
#[derive(Debug, PartialEq, Clone)]
pub enum ConnectionProtocol {
    Http,
    Https,
    Udp,
}

impl ConnectionProtocol {
    fn default_port(&self) -> u16 {
        match self {
            ConnectionProtocol::Http => 80,
            ConnectionProtocol::Https => 443,
            ConnectionProtocol::Udp => 6969,
        }
    }
}

/// Posible `TrackerUrl` errors.
#[derive(Debug, PartialEq)]
pub enum TrackerUrlError {
    InvalidTrackerURL,
    UnsupportedConnectionProtocol,
    InvalidPortNumber,
}

impl TrackerUrl {
    /// Parses an announce url of the shape
    /// `scheme://host[:port]/endpoint`. A missing port falls back to the
    /// scheme's conventional one.
    pub fn parse(url: &str) -> Result<Self, TrackerUrlError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or(TrackerUrlError::InvalidTrackerURL)?;

        let protocol = match scheme {
            "http" => ConnectionProtocol::Http,
            "https" => ConnectionProtocol::Https,
            "udp" => ConnectionProtocol::Udp,
            _ => return Err(TrackerUrlError::UnsupportedConnectionProtocol),
        };

        let (authority, endpoint) = rest
            .split_once('/')
            .ok_or(TrackerUrlError::InvalidTrackerURL)?;

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| TrackerUrlError::InvalidPortNumber)?;
                (host, port)
            }
            None => (authority, protocol.default_port()),
        };
        if host.is_empty() {
            return Err(TrackerUrlError::InvalidTrackerURL);
        }

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
            endpoint: endpoint.to_string(),
        })
    }
}
