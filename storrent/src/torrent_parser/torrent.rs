use std::fmt::Write;

use sha1::{Digest, Sha1};

use bencoder::bencode::Bencode;

use super::info::{FromInfoError, Info};

/// A parsed single-file metainfo: announce url, info dictionary and the
/// 20-byte SHA-1 of the bencoded info dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce_url: String,
    pub info: Info,
    pub info_hash: [u8; 20],
}

#[derive(Debug, PartialEq)]
pub enum FromTorrentError {
    MissingAnnounce,
    MissingInfo,
    FromInfoError(FromInfoError),
    NotADict,
}

impl Torrent {
    pub fn from(bencode: Bencode) -> Result<Torrent, FromTorrentError> {
        let mut announce_url = String::new();
        let mut info: Option<Info> = None;

        let d = match bencode {
            Bencode::BDict(d) => d,
            _ => return Err(FromTorrentError::NotADict),
        };

        for (k, v) in d.iter() {
            if k == b"announce" {
                announce_url = Torrent::create_announce(v)?;
            } else if k == b"info" {
                info = Some(Info::from(v).map_err(FromTorrentError::FromInfoError)?);
            }
        }

        if announce_url.is_empty() {
            return Err(FromTorrentError::MissingAnnounce);
        }

        let info = match info {
            Some(info) => info,
            None => return Err(FromTorrentError::MissingInfo),
        };

        let info_hash = Torrent::create_info_hash(&info);

        Ok(Torrent {
            announce_url,
            info,
            info_hash,
        })
    }

    fn create_announce(bencode: &Bencode) -> Result<String, FromTorrentError> {
        let announce_url = match bencode {
            Bencode::BString(s) => s,
            _ => return Err(FromTorrentError::MissingAnnounce),
        };

        String::from_utf8(announce_url.to_vec()).map_err(|_| FromTorrentError::MissingAnnounce)
    }

    /// SHA-1 over the bencoded info dictionary.
    pub fn create_info_hash(info: &Info) -> [u8; 20] {
        let bencoded_info = Bencode::encode(info);
        Sha1::digest(bencoded_info).into()
    }

    /// Returns the name of the torrent.
    pub fn name(&self) -> String {
        self.info.name.clone()
    }

    /// Returns the length in bytes of the torrent.
    pub fn total_length(&self) -> u64 {
        self.info.length as u64
    }

    /// Returns the size of pieces of the torrent.
    pub fn piece_length(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// Returns the number of pieces of the torrent.
    pub fn total_pieces(&self) -> u32 {
        let length = self.info.length as u64;
        let piece_length = self.info.piece_length as u64;
        ((length + piece_length - 1) / piece_length) as u32
    }

    /// Returns the size of the last piece. Unlike `length % piece_length`
    /// this stays equal to `piece_length` when the total is an exact
    /// multiple.
    pub fn last_piece_length(&self) -> u32 {
        let full_pieces = (self.total_pieces() - 1) as u64;
        (self.total_length() - full_pieces * self.piece_length() as u64) as u32
    }

    /// Returns the real size of the piece at `index`: `piece_length` for
    /// every piece but the last.
    pub fn effective_piece_length(&self, index: u32) -> u32 {
        if index == self.total_pieces() - 1 {
            self.last_piece_length()
        } else {
            self.piece_length()
        }
    }

    /// Returns the expected 20-byte SHA-1 digest of the piece at `index`.
    pub fn piece_digest(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * 20;
        let end = start + 20;
        if end > self.info.pieces.len() {
            return None;
        }
        Some(&self.info.pieces[start..end])
    }

    /// Hex rendering of the infohash, for logs and errors.
    pub fn info_hash_hex(&self) -> String {
        let mut hex = String::with_capacity(40);
        for byte in self.info_hash {
            let _ = write!(&mut hex, "{:02x}", byte);
        }
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_torrent_full() {
        let announce = String::from("http://example.com/announce");
        let info_bencode = build_info_bencode(10, b"example".to_vec(), 20, vec![9; 20]);
        let torrent_bencode = build_torrent_bencode(announce.clone().into_bytes(), info_bencode);

        let torrent = Torrent::from(torrent_bencode).unwrap();

        assert_eq!(torrent.announce_url, announce);
        assert_eq!(torrent.info.length, 10);
        assert_eq!(torrent.info.name, "example");
        assert_eq!(torrent.info.piece_length, 20);
        assert_eq!(torrent.info.pieces, vec![9; 20]);
        assert_eq!(torrent.info_hash, Torrent::create_info_hash(&torrent.info));
    }

    #[test]
    fn test_from_torrent_missing_announce() {
        let mut m = BTreeMap::new();
        m.insert(b"info".to_vec(), Bencode::BDict(BTreeMap::new()));
        let torrent_bencode = Bencode::BDict(m);

        let actual_err = Torrent::from(torrent_bencode).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::MissingAnnounce);
    }

    #[test]
    fn test_from_torrent_missing_info() {
        let announce = String::from("http://example.com/announce").into_bytes();
        let mut m = BTreeMap::new();
        m.insert(b"announce".to_vec(), Bencode::BString(announce));
        let torrent_bencode = Bencode::BDict(m);

        let actual_err = Torrent::from(torrent_bencode).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::MissingInfo);
    }

    #[test]
    fn test_from_torrent_not_a_dict() {
        let torrent_bencode = Bencode::BString(String::from("test").into_bytes());

        let actual_err = Torrent::from(torrent_bencode).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::NotADict);
    }

    #[test]
    fn test_total_pieces_rounds_up() {
        let torrent = build_test_torrent(105, 10, 11);
        assert_eq!(torrent.total_pieces(), 11);
    }

    #[test]
    fn test_last_piece_length_with_remainder() {
        let torrent = build_test_torrent(105, 10, 11);
        assert_eq!(torrent.last_piece_length(), 5);
        assert_eq!(torrent.effective_piece_length(10), 5);
        assert_eq!(torrent.effective_piece_length(0), 10);
    }

    #[test]
    fn test_last_piece_length_exact_multiple() {
        let torrent = build_test_torrent(100, 10, 10);
        assert_eq!(torrent.total_pieces(), 10);
        assert_eq!(torrent.last_piece_length(), 10);
        assert_eq!(torrent.effective_piece_length(9), 10);
    }

    #[test]
    fn test_piece_digest() {
        let mut pieces = vec![1; 20];
        pieces.extend(vec![2; 20]);
        let torrent = Torrent {
            announce_url: String::from("http://example.com/announce"),
            info: Info {
                length: 40,
                name: String::from("example"),
                piece_length: 20,
                pieces,
                private: None,
            },
            info_hash: [0; 20],
        };

        assert_eq!(torrent.piece_digest(0).unwrap(), &[1; 20]);
        assert_eq!(torrent.piece_digest(1).unwrap(), &[2; 20]);
        assert!(torrent.piece_digest(2).is_none());
    }

    #[test]
    fn test_info_hash_hex() {
        let mut torrent = build_test_torrent(10, 10, 1);
        torrent.info_hash = [
            0x2c, 0x6b, 0x68, 0x58, 0xd6, 0x1d, 0xa9, 0x54, 0x3d, 0x42, 0x31, 0xa7, 0x1d, 0xb4,
            0xb1, 0xc9, 0x26, 0x4b, 0x06, 0x85,
        ];
        assert_eq!(
            torrent.info_hash_hex(),
            "2c6b6858d61da9543d4231a71db4b1c9264b0685"
        );
    }

    fn build_info_bencode(
        length: i64,
        name: Vec<u8>,
        pieces_len: i64,
        pieces: Vec<u8>,
    ) -> BTreeMap<Vec<u8>, Bencode> {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(length));
        info.insert(b"name".to_vec(), Bencode::BString(name));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(pieces_len));
        info.insert(b"pieces".to_vec(), Bencode::BString(pieces));

        info
    }

    fn build_torrent_bencode(announce: Vec<u8>, info: BTreeMap<Vec<u8>, Bencode>) -> Bencode {
        let mut dict = BTreeMap::new();

        dict.insert(b"announce".to_vec(), Bencode::BString(announce));
        dict.insert(b"info".to_vec(), Bencode::BDict(info));

        Bencode::BDict(dict)
    }

    fn build_test_torrent(length: i64, piece_length: i64, pieces: usize) -> Torrent {
        Torrent {
            announce_url: String::from("http://example.com/announce"),
            info: Info {
                length,
                name: String::from("example"),
                piece_length,
                pieces: vec![0; pieces * 20],
                private: None,
            },
            info_hash: [0; 20],
        }
    }
}
