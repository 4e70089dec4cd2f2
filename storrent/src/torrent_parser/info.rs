use std::collections::BTreeMap;

use bencoder::bencode::{Bencode, ToBencode};

/// The `info` dictionary of a single-file torrent.
///
/// `pieces` is the concatenation of the 20-byte SHA-1 digests, one per
/// piece, in piece order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Info {
    pub length: i64,
    pub name: String,
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: Option<i64>,
}

#[derive(Debug, PartialEq)]
pub enum FromInfoError {
    MissingLength,
    MissingName,
    MissingPieceLength,
    MissingPieces,
    InvalidPieces,
    NotADict,
    MultipleFilesNotSupported,
}

impl Info {
    pub fn from(bencode: &Bencode) -> Result<Info, FromInfoError> {
        let mut name = String::new();
        let mut length = 0;
        let mut piece_length = 0;
        let mut pieces = Vec::new();
        let mut private = None;

        let d = match bencode {
            Bencode::BDict(d) => d,
            _ => return Err(FromInfoError::NotADict),
        };

        for (k, v) in d.iter() {
            if k == b"name" {
                name = Info::create_name(v)?;
            } else if k == b"length" {
                length = Info::create_number(v, FromInfoError::MissingLength)?;
            } else if k == b"piece length" {
                piece_length = Info::create_number(v, FromInfoError::MissingPieceLength)?;
            } else if k == b"pieces" {
                pieces = Info::create_pieces(v)?;
            } else if k == b"private" {
                private = Some(Info::create_number(v, FromInfoError::NotADict)?);
            } else if k == b"files" {
                return Err(FromInfoError::MultipleFilesNotSupported);
            }
        }

        if pieces.len() % 20 != 0 {
            return Err(FromInfoError::InvalidPieces);
        }

        Ok(Info {
            length,
            name,
            piece_length,
            pieces,
            private,
        })
    }

    fn create_name(bencode: &Bencode) -> Result<String, FromInfoError> {
        let bytes = match bencode {
            Bencode::BString(s) => s,
            _ => return Err(FromInfoError::MissingName),
        };

        String::from_utf8(bytes.to_vec()).map_err(|_| FromInfoError::MissingName)
    }

    fn create_number(bencode: &Bencode, err: FromInfoError) -> Result<i64, FromInfoError> {
        match bencode {
            Bencode::BNumber(n) => Ok(*n),
            _ => Err(err),
        }
    }

    fn create_pieces(bencode: &Bencode) -> Result<Vec<u8>, FromInfoError> {
        match bencode {
            Bencode::BString(s) => Ok(s.to_vec()),
            _ => Err(FromInfoError::MissingPieces),
        }
    }
}

impl ToBencode for Info {
    fn to_bencode(&self) -> Bencode {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), self.length.to_bencode());
        info.insert(b"name".to_vec(), self.name.to_bencode());
        info.insert(b"piece length".to_vec(), self.piece_length.to_bencode());
        info.insert(b"pieces".to_vec(), self.pieces.to_bencode());
        if let Some(private) = self.private {
            info.insert(b"private".to_vec(), private.to_bencode());
        }
        Bencode::BDict(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_info_full() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(1));
        info.insert(b"name".to_vec(), Bencode::BString(b"test1".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(2));
        info.insert(b"pieces".to_vec(), Bencode::BString(vec![7; 20]));
        let bencode = Bencode::BDict(info);

        let response = Info::from(&bencode).unwrap();
        assert_eq!(response.length, 1);
        assert_eq!(response.name, "test1");
        assert_eq!(response.piece_length, 2);
        assert_eq!(response.pieces, vec![7; 20]);
        assert_eq!(response.private, None);
    }

    #[test]
    fn test_from_info_with_private_flag() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(1));
        info.insert(b"name".to_vec(), Bencode::BString(b"test1".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(2));
        info.insert(b"pieces".to_vec(), Bencode::BString(vec![7; 20]));
        info.insert(b"private".to_vec(), Bencode::BNumber(1));
        let bencode = Bencode::BDict(info);

        let response = Info::from(&bencode).unwrap();
        assert_eq!(response.private, Some(1));
    }

    #[test]
    fn test_from_info_with_multiple_files() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Bencode::BString(b"test1".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(2));
        info.insert(b"pieces".to_vec(), Bencode::BString(vec![7; 20]));
        info.insert(b"files".to_vec(), Bencode::BList(vec![]));
        let bencode = Bencode::BDict(info);

        let response = Info::from(&bencode).unwrap_err();
        assert_eq!(response, FromInfoError::MultipleFilesNotSupported);
    }

    #[test]
    fn test_from_info_with_ragged_digests() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(1));
        info.insert(b"name".to_vec(), Bencode::BString(b"test1".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::BNumber(2));
        info.insert(b"pieces".to_vec(), Bencode::BString(vec![7; 19]));
        let bencode = Bencode::BDict(info);

        let response = Info::from(&bencode).unwrap_err();
        assert_eq!(response, FromInfoError::InvalidPieces);
    }

    #[test]
    fn test_from_info_not_a_dict() {
        let bencode = Bencode::BString(b"test".to_vec());
        assert_eq!(Info::from(&bencode).unwrap_err(), FromInfoError::NotADict);
    }

    #[test]
    fn test_private_flag_survives_reencoding() {
        let info = Info {
            length: 1,
            name: "test".to_string(),
            piece_length: 2,
            pieces: vec![7; 20],
            private: Some(1),
        };

        let encoded = Bencode::encode(&info);
        let reparsed = Info::from(&Bencode::decode(&encoded).unwrap()).unwrap();
        assert_eq!(reparsed, info);
    }
}
