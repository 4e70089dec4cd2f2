use std::collections::{HashSet, VecDeque};

use super::peer_message::Bitfield;

/// Protocol state of one peer connection.
///
/// The four booleans start at the values the wire protocol prescribes:
/// both sides choked, neither side interested.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// We are choking the remote peer.
    pub am_choking: bool,
    /// We want pieces the remote peer has.
    pub am_interested: bool,
    /// The remote peer is choking us.
    pub peer_choking: bool,
    /// The remote peer wants pieces we have.
    pub peer_interested: bool,
    /// Pieces the remote peer claims to possess.
    pub remote_bitfield: Bitfield,
    /// Requests sent for which no PIECE has arrived yet.
    pub in_flight: u32,
    /// Block offsets of the current piece already requested. Entries
    /// outlive a CHOKE; they reset only when a piece is reserved anew
    /// or abandoned.
    pub requested: HashSet<u32>,
    /// Blocks read for the remote's REQUESTs, waiting to be written out.
    pub pending_uploads: VecDeque<(u32, u32, Vec<u8>)>,
    /// `(index, begin)` pairs cancelled by the remote; each suppresses
    /// the next matching outbound PIECE exactly once.
    pub cancelled: Vec<(u32, u32)>,
    /// Kilobits per second, refreshed by the choking loop.
    pub download_speed: f64,
    /// Kilobits per second, refreshed when serving blocks.
    pub upload_speed: f64,
}

impl SessionStatus {
    pub fn new(remote_bitfield: Bitfield) -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_bitfield,
            in_flight: 0,
            requested: HashSet::new(),
            pending_uploads: VecDeque::new(),
            cancelled: Vec::new(),
            download_speed: 0.0,
            upload_speed: 0.0,
        }
    }
}
