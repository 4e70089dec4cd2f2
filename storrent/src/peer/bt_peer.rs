use bencoder::bencode::Bencode;

/// A swarm endpoint as reported by the tracker (or learned from an
/// inbound connection). Identity for de-duplication is `(ip, port)`; the
/// peer id is only known once a handshake has been exchanged.
#[derive(Debug, Clone)]
pub struct BtPeer {
    pub ip: String,
    pub port: u16,
    pub peer_id: Option<Vec<u8>>,
}

impl PartialEq for BtPeer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for BtPeer {}

impl std::hash::Hash for BtPeer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

/// Posible `BtPeer` errors
#[derive(Debug, PartialEq)]
pub enum BtPeerError {
    InvalidPeerId,
    InvalidIp,
    InvalidPort,
    NotADict,
    InvalidCompactEntry,
}

impl BtPeer {
    pub fn new(ip: String, port: u16) -> Self {
        Self {
            ip,
            port,
            peer_id: None,
        }
    }

    /// Builds a `BtPeer` from a bencoded dictionary out of a tracker
    /// response peer list.
    ///
    /// It returns a `BtPeerError` if:
    /// - The peer ID is invalid.
    /// - The peer IP is invalid.
    /// - The peer Port is invalid.
    /// - The bencoded peer is not a Dict.
    pub fn from(bencode: Bencode) -> Result<BtPeer, BtPeerError> {
        let mut peer_id: Option<Vec<u8>> = None;
        let mut ip: String = String::new();
        let mut port: u16 = 0;

        let d = match bencode {
            Bencode::BDict(d) => d,
            _ => return Err(BtPeerError::NotADict),
        };

        for (k, v) in d.iter() {
            if k == b"peer id" {
                peer_id = Some(Self::create_peer_id(v)?);
            } else if k == b"ip" {
                ip = Self::create_ip(v)?;
            } else if k == b"port" {
                port = Self::create_port(v)?;
            }
        }

        Ok(BtPeer { ip, port, peer_id })
    }

    /// Builds a `BtPeer` from one 6-byte entry of a compact peer list:
    /// 4 bytes IPv4 address, 2 bytes big-endian port.
    pub fn from_compact(entry: &[u8]) -> Result<BtPeer, BtPeerError> {
        if entry.len() != 6 {
            return Err(BtPeerError::InvalidCompactEntry);
        }
        let ip = format!("{}.{}.{}.{}", entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);

        Ok(BtPeer::new(ip, port))
    }

    /// The `ip:port` form used for connecting and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    fn create_peer_id(bencode: &Bencode) -> Result<Vec<u8>, BtPeerError> {
        match bencode {
            Bencode::BString(s) => Ok(s.clone()),
            _ => Err(BtPeerError::InvalidPeerId),
        }
    }

    fn create_ip(bencode: &Bencode) -> Result<String, BtPeerError> {
        let ip = match bencode {
            Bencode::BString(s) => s,
            _ => return Err(BtPeerError::InvalidIp),
        };

        String::from_utf8(ip.to_vec()).map_err(|_| BtPeerError::InvalidIp)
    }

    fn create_port(bencode: &Bencode) -> Result<u16, BtPeerError> {
        let port = match bencode {
            Bencode::BNumber(n) => *n,
            _ => return Err(BtPeerError::InvalidPort),
        };

        u16::try_from(port).map_err(|_| BtPeerError::InvalidPort)
    }
}
