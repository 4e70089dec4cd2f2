use std::collections::BTreeMap;

/// A bencoded value.
///
/// Dictionaries use a `BTreeMap` so re-encoding always produces the
/// canonical key order, which matters when hashing an info dictionary.
#[derive(PartialEq, Debug, Clone)]
pub enum Bencode {
    BNumber(i64),
    BString(Vec<u8>),
    BList(Vec<Bencode>),
    BDict(BTreeMap<Vec<u8>, Bencode>),
}

/// Posible decoding errors.
#[derive(PartialEq, Debug)]
pub enum BencodeError {
    UnexpectedEnd,
    UnknownPrefix(u8),
    InvalidNumber,
    InvalidStringLength,
    MissingDictKey,
}

pub trait ToBencode {
    fn to_bencode(&self) -> Bencode;
}

impl ToBencode for String {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for &str {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for i64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber(*self)
    }
}

impl ToBencode for u64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber(*self as i64)
    }
}

impl ToBencode for u32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for u16 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for i32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for Vec<u8> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.clone())
    }
}

impl ToBencode for BTreeMap<Vec<u8>, Bencode> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BDict(self.clone())
    }
}

impl<T: ToBencode> ToBencode for Vec<T> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BList(self.iter().map(|v| v.to_bencode()).collect())
    }
}

impl ToBencode for Bencode {
    fn to_bencode(&self) -> Bencode {
        self.clone()
    }
}

impl Bencode {
    /// Parses a bencoded byte slice into a `Bencode` value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// let bencode = Bencode::decode(b"5:hello").unwrap();
    /// assert_eq!(bencode, Bencode::BString(b"hello".to_vec()));
    ///
    /// let bencode = Bencode::decode(b"i-42e").unwrap();
    /// assert_eq!(bencode, Bencode::BNumber(-42));
    /// ```
    pub fn decode(data: &[u8]) -> Result<Bencode, BencodeError> {
        let (value, _) = Bencode::parse(data, 0)?;
        Ok(value)
    }

    /// Serializes any `ToBencode` value into its bencoded byte form.
    pub fn encode<T: ToBencode>(value: &T) -> Vec<u8> {
        let mut out = Vec::new();
        value.to_bencode().write_into(&mut out);
        out
    }

    fn parse(data: &[u8], at: usize) -> Result<(Bencode, usize), BencodeError> {
        match data.get(at) {
            None => Err(BencodeError::UnexpectedEnd),
            Some(b'i') => Bencode::parse_number(data, at),
            Some(b'l') => Bencode::parse_list(data, at),
            Some(b'd') => Bencode::parse_dict(data, at),
            Some(b'0'..=b'9') => Bencode::parse_string(data, at),
            Some(other) => Err(BencodeError::UnknownPrefix(*other)),
        }
    }

    fn parse_number(data: &[u8], at: usize) -> Result<(Bencode, usize), BencodeError> {
        let mut end = at + 1;
        while *data.get(end).ok_or(BencodeError::UnexpectedEnd)? != b'e' {
            end += 1;
        }
        let digits =
            std::str::from_utf8(&data[at + 1..end]).map_err(|_| BencodeError::InvalidNumber)?;
        let number: i64 = digits.parse().map_err(|_| BencodeError::InvalidNumber)?;
        Ok((Bencode::BNumber(number), end + 1))
    }

    fn parse_string(data: &[u8], at: usize) -> Result<(Bencode, usize), BencodeError> {
        let mut colon = at;
        while *data.get(colon).ok_or(BencodeError::UnexpectedEnd)? != b':' {
            colon += 1;
        }
        let digits = std::str::from_utf8(&data[at..colon])
            .map_err(|_| BencodeError::InvalidStringLength)?;
        let length: usize = digits
            .parse()
            .map_err(|_| BencodeError::InvalidStringLength)?;

        let start = colon + 1;
        let end = start + length;
        if end > data.len() {
            return Err(BencodeError::UnexpectedEnd);
        }
        Ok((Bencode::BString(data[start..end].to_vec()), end))
    }

    fn parse_list(data: &[u8], at: usize) -> Result<(Bencode, usize), BencodeError> {
        let mut items = Vec::new();
        let mut next = at + 1;
        loop {
            match data.get(next) {
                None => return Err(BencodeError::UnexpectedEnd),
                Some(b'e') => return Ok((Bencode::BList(items), next + 1)),
                Some(_) => {
                    let (item, after) = Bencode::parse(data, next)?;
                    items.push(item);
                    next = after;
                }
            }
        }
    }

    fn parse_dict(data: &[u8], at: usize) -> Result<(Bencode, usize), BencodeError> {
        let mut dict = BTreeMap::new();
        let mut next = at + 1;
        loop {
            match data.get(next) {
                None => return Err(BencodeError::UnexpectedEnd),
                Some(b'e') => return Ok((Bencode::BDict(dict), next + 1)),
                Some(_) => {
                    let (key, after_key) = Bencode::parse(data, next)?;
                    let key = match key {
                        Bencode::BString(key) => key,
                        _ => return Err(BencodeError::MissingDictKey),
                    };
                    let (value, after_value) = Bencode::parse(data, after_key)?;
                    dict.insert(key, value);
                    next = after_value;
                }
            }
        }
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::BNumber(n) => {
                out.push(b'i');
                out.extend(n.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::BString(s) => {
                out.extend(s.len().to_string().as_bytes());
                out.push(b':');
                out.extend(s);
            }
            Bencode::BList(items) => {
                out.push(b'l');
                for item in items {
                    item.write_into(out);
                }
                out.push(b'e');
            }
            Bencode::BDict(dict) => {
                out.push(b'd');
                for (key, value) in dict {
                    out.extend(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend(key);
                    value.write_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_string() {
        let bencode = Bencode::decode(b"4:spam").unwrap();
        assert_eq!(bencode, Bencode::BString(b"spam".to_vec()));
    }

    #[test]
    fn test_decode_empty_string() {
        let bencode = Bencode::decode(b"0:").unwrap();
        assert_eq!(bencode, Bencode::BString(vec![]));
    }

    #[test]
    fn test_decode_number() {
        let bencode = Bencode::decode(b"i123e").unwrap();
        assert_eq!(bencode, Bencode::BNumber(123));
    }

    #[test]
    fn test_decode_negative_number() {
        let bencode = Bencode::decode(b"i-7e").unwrap();
        assert_eq!(bencode, Bencode::BNumber(-7));
    }

    #[test]
    fn test_decode_list() {
        let bencode = Bencode::decode(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            bencode,
            Bencode::BList(vec![
                Bencode::BString(b"spam".to_vec()),
                Bencode::BString(b"eggs".to_vec()),
            ])
        );
    }

    #[test]
    fn test_decode_dict() {
        let bencode = Bencode::decode(b"d3:cow3:moo4:spami3ee").unwrap();

        let mut expected = BTreeMap::new();
        expected.insert(b"cow".to_vec(), Bencode::BString(b"moo".to_vec()));
        expected.insert(b"spam".to_vec(), Bencode::BNumber(3));

        assert_eq!(bencode, Bencode::BDict(expected));
    }

    #[test]
    fn test_decode_nested() {
        let bencode = Bencode::decode(b"d4:infod6:lengthi10eee").unwrap();

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::BNumber(10));
        let mut outer = BTreeMap::new();
        outer.insert(b"info".to_vec(), Bencode::BDict(info));

        assert_eq!(bencode, Bencode::BDict(outer));
    }

    #[test]
    fn test_decode_empty_input() {
        assert_eq!(Bencode::decode(b"").unwrap_err(), BencodeError::UnexpectedEnd);
    }

    #[test]
    fn test_decode_unknown_prefix() {
        assert_eq!(
            Bencode::decode(b"x123").unwrap_err(),
            BencodeError::UnknownPrefix(b'x')
        );
    }

    #[test]
    fn test_decode_string_too_short() {
        assert_eq!(
            Bencode::decode(b"10:abc").unwrap_err(),
            BencodeError::UnexpectedEnd
        );
    }

    #[test]
    fn test_decode_bad_number() {
        assert_eq!(
            Bencode::decode(b"i12x4e").unwrap_err(),
            BencodeError::InvalidNumber
        );
    }

    #[test]
    fn test_decode_non_string_dict_key() {
        assert_eq!(
            Bencode::decode(b"di1e3:mooe").unwrap_err(),
            BencodeError::MissingDictKey
        );
    }

    #[test]
    fn test_encode_number() {
        assert_eq!(Bencode::encode(&-42i64), b"i-42e".to_vec());
    }

    #[test]
    fn test_encode_string() {
        assert_eq!(Bencode::encode(&"spam"), b"4:spam".to_vec());
    }

    #[test]
    fn test_encode_dict_is_sorted() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zz".to_vec(), Bencode::BNumber(1));
        dict.insert(b"aa".to_vec(), Bencode::BNumber(2));

        assert_eq!(Bencode::encode(&dict), b"d2:aai2e2:zzi1ee".to_vec());
    }

    #[test]
    fn test_round_trip_dict() {
        let data = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e".to_vec();
        let decoded = Bencode::decode(&data).unwrap();
        assert_eq!(Bencode::encode(&decoded), data);
    }
}
