/// Protocol string of BitTorrent v1.
const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake on the wire.
pub const HANDSHAKE_LENGTH: usize = 68;

/// The fixed 68-byte opening exchange: protocol tag, 8 reserved bytes
/// (all zero, no extensions advertised), infohash and peer id.
#[derive(Debug, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

#[derive(Debug, PartialEq)]
pub enum FromHandshakeError {
    InvalidLength,
    InvalidProtocolString,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes the handshake into its wire form.
    pub fn as_bytes(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut bytes = [0; HANDSHAKE_LENGTH];
        bytes[0] = PSTR.len() as u8;
        bytes[1..20].copy_from_slice(PSTR);
        // bytes 20..28 are the reserved block, left zeroed
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Parses a received handshake. Accepts only an exactly 68-byte
    /// buffer carrying the v1 protocol string.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FromHandshakeError> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(FromHandshakeError::InvalidLength);
        }
        if bytes[0] != PSTR.len() as u8 || &bytes[1..20] != PSTR {
            return Err(FromHandshakeError::InvalidProtocolString);
        }

        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}
