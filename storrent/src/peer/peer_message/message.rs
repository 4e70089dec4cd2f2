use super::bitfield::Bitfield;

/// One peer-wire message, keep-alive included.
///
/// Every message kind lives in this one enum so framing, dispatch and
/// logging can pattern-match in a single place instead of switching on
/// numeric ids across the codebase.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
}

#[derive(Debug, PartialEq)]
pub enum MessageError {
    UnknownId(u8),
    BadPayloadLength(u8),
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

impl Message {
    /// Parses one frame body (the bytes after the 4-byte length prefix).
    /// An empty body is a keep-alive.
    pub fn from_frame(body: &[u8]) -> Result<Message, MessageError> {
        let (id, payload) = match body.split_first() {
            None => return Ok(Message::KeepAlive),
            Some((id, payload)) => (*id, payload),
        };

        match id {
            ID_CHOKE => Self::expect_empty(id, payload, Message::Choke),
            ID_UNCHOKE => Self::expect_empty(id, payload, Message::Unchoke),
            ID_INTERESTED => Self::expect_empty(id, payload, Message::Interested),
            ID_NOT_INTERESTED => Self::expect_empty(id, payload, Message::NotInterested),
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(MessageError::BadPayloadLength(id));
                }
                Ok(Message::Have {
                    index: Self::read_u32(&payload[0..4]),
                })
            }
            ID_BITFIELD => Ok(Message::Bitfield(Bitfield::new(payload.to_vec()))),
            ID_REQUEST => {
                let (index, begin, length) = Self::read_block_triple(id, payload)?;
                Ok(Message::Request {
                    index,
                    begin,
                    length,
                })
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(MessageError::BadPayloadLength(id));
                }
                Ok(Message::Piece {
                    index: Self::read_u32(&payload[0..4]),
                    begin: Self::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                })
            }
            ID_CANCEL => {
                let (index, begin, length) = Self::read_block_triple(id, payload)?;
                Ok(Message::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            ID_PORT => {
                if payload.len() != 2 {
                    return Err(MessageError::BadPayloadLength(id));
                }
                Ok(Message::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }
            unknown => Err(MessageError::UnknownId(unknown)),
        }
    }

    /// Serializes the message as a full wire frame: 4-byte big-endian
    /// length prefix, message id and payload. A keep-alive is the bare
    /// zero prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => body.push(ID_CHOKE),
            Message::Unchoke => body.push(ID_UNCHOKE),
            Message::Interested => body.push(ID_INTERESTED),
            Message::NotInterested => body.push(ID_NOT_INTERESTED),
            Message::Have { index } => {
                body.push(ID_HAVE);
                body.extend(index.to_be_bytes());
            }
            Message::Bitfield(bitfield) => {
                body.push(ID_BITFIELD);
                body.extend(bitfield.as_bytes());
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                body.push(ID_REQUEST);
                body.extend(index.to_be_bytes());
                body.extend(begin.to_be_bytes());
                body.extend(length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                body.push(ID_PIECE);
                body.extend(index.to_be_bytes());
                body.extend(begin.to_be_bytes());
                body.extend(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                body.push(ID_CANCEL);
                body.extend(index.to_be_bytes());
                body.extend(begin.to_be_bytes());
                body.extend(length.to_be_bytes());
            }
            Message::Port { port } => {
                body.push(ID_PORT);
                body.extend(port.to_be_bytes());
            }
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend((body.len() as u32).to_be_bytes());
        frame.extend(body);
        frame
    }

    fn expect_empty(id: u8, payload: &[u8], message: Message) -> Result<Message, MessageError> {
        if payload.is_empty() {
            Ok(message)
        } else {
            Err(MessageError::BadPayloadLength(id))
        }
    }

    fn read_block_triple(id: u8, payload: &[u8]) -> Result<(u32, u32, u32), MessageError> {
        if payload.len() != 12 {
            return Err(MessageError::BadPayloadLength(id));
        }
        Ok((
            Self::read_u32(&payload[0..4]),
            Self::read_u32(&payload[4..8]),
            Self::read_u32(&payload[8..12]),
        ))
    }

    fn read_u32(bytes: &[u8]) -> u32 {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}
