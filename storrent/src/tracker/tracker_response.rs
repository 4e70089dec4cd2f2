use bencoder::bencode::{Bencode, BencodeError};

use crate::peer::bt_peer::{BtPeer, BtPeerError};

/// `TrackerResponse` struct containing a tracker response.
///
/// To create a new `TrackerResponse` use the method builder `from()`.
#[derive(Debug)]
pub struct TrackerResponse {
    pub interval: i64,
    pub complete: i64,
    pub incomplete: i64,
    pub peers: Vec<BtPeer>,
}

/// Posible `TrackerResponse` errors.
#[derive(Debug)]
pub enum FromTrackerResponseError {
    DecodeResponseError(BencodeError),
    InvalidInterval,
    InvalidComplete,
    InvalidIncomplete,
    InvalidPeers(BtPeerError),
    FailureReason(String),
    NotADict,
    NotAList,
}

impl TrackerResponse {
    /// Builds a new `TrackerResponse` decoding a bencoded response body.
    ///
    /// It returns a `FromTrackerResponseError` if:
    /// - The response fails to decode or is not a dict.
    /// - The tracker answered with a failure reason.
    /// - Any field has the wrong shape.
    pub fn from(response: Vec<u8>) -> Result<TrackerResponse, FromTrackerResponseError> {
        let mut interval = 0;
        let mut complete = 0;
        let mut incomplete = 0;
        let mut peers = Vec::new();

        let decoded = Bencode::decode(&response)
            .map_err(FromTrackerResponseError::DecodeResponseError)?;

        let d = match decoded {
            Bencode::BDict(d) => d,
            _ => return Err(FromTrackerResponseError::NotADict),
        };

        for (k, v) in d.iter() {
            if k == b"failure reason" {
                return Err(Self::create_failure(v));
            } else if k == b"interval" {
                interval = Self::create_number(v, FromTrackerResponseError::InvalidInterval)?;
            } else if k == b"complete" {
                complete = Self::create_number(v, FromTrackerResponseError::InvalidComplete)?;
            } else if k == b"incomplete" {
                incomplete = Self::create_number(v, FromTrackerResponseError::InvalidIncomplete)?;
            } else if k == b"peers" {
                peers = Self::create_peers(v)?;
            }
        }

        Ok(TrackerResponse {
            interval,
            complete,
            incomplete,
            peers,
        })
    }

    fn create_failure(bencode: &Bencode) -> FromTrackerResponseError {
        let reason = match bencode {
            Bencode::BString(s) => String::from_utf8_lossy(s).to_string(),
            _ => String::from("unknown"),
        };
        FromTrackerResponseError::FailureReason(reason)
    }

    fn create_number(
        bencode: &Bencode,
        err: FromTrackerResponseError,
    ) -> Result<i64, FromTrackerResponseError> {
        match bencode {
            Bencode::BNumber(n) => Ok(*n),
            _ => Err(err),
        }
    }

    fn create_peers(bencode: &Bencode) -> Result<Vec<BtPeer>, FromTrackerResponseError> {
        match bencode {
            Bencode::BList(list) => Self::create_peers_from_dicts(list),
            Bencode::BString(compact) => Self::create_peers_from_compact(compact),
            _ => Err(FromTrackerResponseError::NotAList),
        }
    }

    fn create_peers_from_dicts(list: &[Bencode]) -> Result<Vec<BtPeer>, FromTrackerResponseError> {
        let mut peers = Vec::new();

        for entry in list {
            let peer =
                BtPeer::from(entry.clone()).map_err(FromTrackerResponseError::InvalidPeers)?;
            peers.push(peer);
        }

        Ok(peers)
    }

    fn create_peers_from_compact(compact: &[u8]) -> Result<Vec<BtPeer>, FromTrackerResponseError> {
        compact
            .chunks(6)
            .map(|chunk| BtPeer::from_compact(chunk).map_err(FromTrackerResponseError::InvalidPeers))
            .collect()
    }
}
