use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};

use sha1::{Digest, Sha1};
use tracing::{error, info, warn};

use crate::config::cfg::Cfg;
use crate::peer::bt_peer::BtPeer;
use crate::peer::peer_message::Bitfield;
use crate::peer::session_handle::{PieceEvent, SessionHandle};
use crate::storage_manager::manager::{create_output_file, ReadAtOffset, WriteAtOffset};
use crate::torrent_handler::work_queue::{WorkQueue, WorkQueueError};
use crate::torrent_parser::torrent::Torrent;
use crate::BLOCK_SIZE;

/// Download state of one piece.
#[derive(Debug, PartialEq)]
pub enum PieceState {
    /// Not started; its index sits in the work queue.
    Needed,
    /// Some blocks have arrived, keyed by their offset within the piece.
    InProgress {
        blocks: BTreeMap<u32, Vec<u8>>,
        bytes_have: u64,
    },
    /// Verified against its digest and durable in the output file.
    Verified,
}

/// The byte totals the tracker reports on every announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmCounters {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// What happened to a block handed to [`PieceStore::accept_block`].
#[derive(Debug, PartialEq)]
pub enum BlockResult {
    Accepted,
    Duplicate,
    AlreadyVerified,
    PieceVerified,
    PieceRejected,
}

/// Piece states, in-flight buffers and swarm counters live under one lock
/// so they can never disagree with each other.
#[derive(Debug)]
struct StoreInner {
    pieces: Vec<PieceState>,
    counters: SwarmCounters,
}

/// Owner of everything piece-related: the block buffers, the verified set,
/// the swarm counters and the output file handle. Shared across sessions
/// behind an `Arc`; every mutation goes through the inner lock.
///
/// The store also keeps the registry of live peer sessions. Registration
/// makes a session reachable by the choking loop and by the HAVE
/// broadcast; deregistration feeds the disconnect channel the supervisor
/// blocks on when the peer cap is reached.
#[derive(Debug)]
pub struct PieceStore {
    torrent: Torrent,
    inner: Mutex<StoreInner>,
    output: Mutex<File>,
    work_queue: Arc<WorkQueue>,
    sessions: Mutex<HashMap<BtPeer, Arc<SessionHandle>>>,
    current_peers: AtomicUsize,
    all_current_peers: AtomicUsize,
    disconnect_sender: SyncSender<usize>,
}

#[derive(Debug)]
pub enum PieceStoreError {
    PoisonedPieceLock,
    PoisonedFileLock,
    PoisonedSessionsLock,
    InvalidPieceIndex,
    BlockOutOfRange,
    PieceNotVerified,
    NoPeersConnected,
    OutputFileError(std::io::Error),
    WorkQueueError(WorkQueueError),
}

impl PieceStore {
    /// Creates the store and the truncated output file. Failing to create
    /// the file is fatal to the process, so it surfaces here rather than
    /// on the first verified piece.
    ///
    /// Returns the store plus the receiver end of the disconnect channel;
    /// each value received is the number of peers still connected or
    /// connecting after somebody left.
    pub fn new(
        torrent: &Torrent,
        config: Cfg,
        work_queue: Arc<WorkQueue>,
    ) -> Result<(Self, Receiver<usize>), PieceStoreError> {
        let output = create_output_file(&config.download_directory, &torrent.info.name)
            .map_err(PieceStoreError::OutputFileError)?;

        let total_pieces = torrent.total_pieces();
        let pieces = (0..total_pieces).map(|_| PieceState::Needed).collect();

        let (disconnect_sender, disconnect_receiver) =
            sync_channel((config.max_peers_per_torrent * 100) as usize);

        Ok((
            Self {
                inner: Mutex::new(StoreInner {
                    pieces,
                    counters: SwarmCounters {
                        uploaded: 0,
                        downloaded: 0,
                        left: torrent.total_length(),
                    },
                }),
                torrent: torrent.clone(),
                output: Mutex::new(output),
                work_queue,
                sessions: Mutex::new(HashMap::new()),
                current_peers: AtomicUsize::new(0),
                all_current_peers: AtomicUsize::new(0),
                disconnect_sender,
            },
            disconnect_receiver,
        ))
    }

    /// Feeds one received block into the piece it belongs to.
    ///
    /// Blocks for already-verified pieces and duplicate offsets are
    /// discarded without touching the counters, so replaying a block is
    /// idempotent. When the last missing block arrives the piece is
    /// assembled, hashed and either committed to disk or rolled back and
    /// requeued at the head of the work queue.
    pub fn accept_block(
        &self,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> Result<BlockResult, PieceStoreError> {
        let expected = self.expected_piece_length(index)?;
        if begin as u64 + block.len() as u64 > expected as u64 {
            return Err(PieceStoreError::BlockOutOfRange);
        }

        let mut inner = self.lock_inner()?;
        let state = &mut inner.pieces[index as usize];
        match state {
            PieceState::Verified => return Ok(BlockResult::AlreadyVerified),
            PieceState::Needed => {
                let mut blocks = BTreeMap::new();
                blocks.insert(begin, block.to_vec());
                *state = PieceState::InProgress {
                    blocks,
                    bytes_have: block.len() as u64,
                };
            }
            PieceState::InProgress { blocks, bytes_have } => {
                if blocks.contains_key(&begin) {
                    return Ok(BlockResult::Duplicate);
                }
                blocks.insert(begin, block.to_vec());
                *bytes_have += block.len() as u64;
            }
        }
        inner.counters.downloaded += block.len() as u64;
        inner.counters.left -= block.len() as u64;

        let complete = match &inner.pieces[index as usize] {
            PieceState::InProgress { bytes_have, .. } => *bytes_have == expected as u64,
            _ => false,
        };
        let result = if complete {
            self.verify_and_commit(&mut inner, index)?
        } else {
            BlockResult::Accepted
        };

        // Broadcast under the piece lock: a thread that observes the new
        // piece state is guaranteed to find the event already queued.
        match result {
            BlockResult::PieceVerified => self.broadcast(PieceEvent::Verified(index))?,
            BlockResult::PieceRejected => self.broadcast(PieceEvent::Rejected(index))?,
            _ => {}
        }
        Ok(result)
    }

    /// Assembles the piece, checks its SHA-1 against the metainfo digest
    /// and either writes it at `index * piece_length` or rolls everything
    /// back. Called with the piece complete and the inner lock held.
    fn verify_and_commit(
        &self,
        inner: &mut StoreInner,
        index: u32,
    ) -> Result<BlockResult, PieceStoreError> {
        let state = std::mem::replace(&mut inner.pieces[index as usize], PieceState::Needed);
        let (blocks, bytes_have) = match state {
            PieceState::InProgress { blocks, bytes_have } => (blocks, bytes_have),
            _ => return Err(PieceStoreError::PieceNotVerified),
        };

        let mut assembled = Vec::with_capacity(bytes_have as usize);
        for block in blocks.into_values() {
            assembled.extend(block);
        }

        let digest: [u8; 20] = Sha1::digest(&assembled).into();
        let expected = self
            .torrent
            .piece_digest(index)
            .ok_or(PieceStoreError::InvalidPieceIndex)?;

        if digest.as_slice() != expected {
            inner.counters.downloaded -= bytes_have;
            inner.counters.left += bytes_have;
            self.work_queue
                .return_head(index)
                .map_err(PieceStoreError::WorkQueueError)?;
            warn!(
                "Piece {} failed verification, dropping {} bytes and retrying",
                index, bytes_have
            );
            return Ok(BlockResult::PieceRejected);
        }

        let offset = index as u64 * self.torrent.piece_length() as u64;
        let mut output = self.lock_output()?;
        output
            .write_all_at_offset(&assembled, offset)
            .unwrap_or_else(|err| fatal_disk_error(err));
        drop(output);

        inner.pieces[index as usize] = PieceState::Verified;

        let verified = inner
            .pieces
            .iter()
            .filter(|state| **state == PieceState::Verified)
            .count();
        info!(
            "Piece {} verified ({}/{} pieces)",
            index,
            verified,
            self.torrent.total_pieces()
        );
        if inner.counters.left == 0 {
            info!("All pieces verified, download complete");
        }
        Ok(BlockResult::PieceVerified)
    }

    /// Reads a verified block back from the output file for serving. The
    /// uploaded counter moves under the same lock as the state check.
    pub fn read_block(
        &self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<Vec<u8>, PieceStoreError> {
        let expected = self.expected_piece_length(index)?;
        if begin as u64 + length as u64 > expected as u64 {
            return Err(PieceStoreError::BlockOutOfRange);
        }

        let mut inner = self.lock_inner()?;
        if inner.pieces[index as usize] != PieceState::Verified {
            return Err(PieceStoreError::PieceNotVerified);
        }

        let offset = index as u64 * self.torrent.piece_length() as u64 + begin as u64;
        let mut buffer = vec![0; length as usize];
        let mut output = self.lock_output()?;
        output
            .read_exact_at_offset(&mut buffer, offset)
            .unwrap_or_else(|err| fatal_disk_error(err));
        drop(output);

        inner.counters.uploaded += length as u64;
        Ok(buffer)
    }

    /// The blocks of `index` that nobody has delivered yet, as
    /// `(offset, length)` pairs with the final length clipped to the
    /// piece's real size. `None` means the piece is already verified.
    pub fn missing_blocks(&self, index: u32) -> Result<Option<Vec<(u32, u32)>>, PieceStoreError> {
        let expected = self.expected_piece_length(index)?;
        let inner = self.lock_inner()?;

        let have: Option<&BTreeMap<u32, Vec<u8>>> = match &inner.pieces[index as usize] {
            PieceState::Verified => return Ok(None),
            PieceState::Needed => None,
            PieceState::InProgress { blocks, .. } => Some(blocks),
        };

        let mut missing = Vec::new();
        let mut begin = 0;
        while begin < expected {
            if have.map_or(true, |blocks| !blocks.contains_key(&begin)) {
                let length = BLOCK_SIZE.min(expected - begin);
                missing.push((begin, length));
            }
            begin += BLOCK_SIZE;
        }
        Ok(Some(missing))
    }

    /// Snapshot of the verified pieces as a wire-ready bitfield.
    pub fn local_bitfield(&self) -> Result<Bitfield, PieceStoreError> {
        let inner = self.lock_inner()?;
        let mut bitfield = Bitfield::for_piece_count(self.torrent.total_pieces());
        for (index, state) in inner.pieces.iter().enumerate() {
            if *state == PieceState::Verified {
                bitfield.set_piece(index as u32);
            }
        }
        Ok(bitfield)
    }

    pub fn counters(&self) -> Result<SwarmCounters, PieceStoreError> {
        Ok(self.lock_inner()?.counters)
    }

    /// The download is done once nothing is left to fetch.
    pub fn is_finished(&self) -> Result<bool, PieceStoreError> {
        Ok(self.lock_inner()?.counters.left == 0)
    }

    pub fn downloaded_pieces(&self) -> Result<usize, PieceStoreError> {
        Ok(self
            .lock_inner()?
            .pieces
            .iter()
            .filter(|state| **state == PieceState::Verified)
            .count())
    }

    pub fn is_piece_verified(&self, index: u32) -> Result<bool, PieceStoreError> {
        if index >= self.torrent.total_pieces() {
            return Err(PieceStoreError::InvalidPieceIndex);
        }
        Ok(self.lock_inner()?.pieces[index as usize] == PieceState::Verified)
    }

    // ------------------------------------------------------------------
    // Session registry

    /// Counts a dial attempt before the connection exists, so the peer cap
    /// covers connecting peers too.
    pub fn peer_connecting(&self) {
        self.all_current_peers.fetch_add(1, Ordering::Relaxed);
    }

    /// Rolls back `peer_connecting` after a failed dial or handshake.
    pub fn peer_connecting_failed(&self) {
        self.all_current_peers.fetch_sub(1, Ordering::Relaxed);
        self.notify_peer_disconnected();
    }

    /// Registers an established session, making it visible to the choking
    /// loop and the HAVE broadcast.
    pub fn peer_connected(
        &self,
        peer: &BtPeer,
        handle: Arc<SessionHandle>,
    ) -> Result<(), PieceStoreError> {
        let mut sessions = self.lock_sessions()?;
        self.current_peers.fetch_add(1, Ordering::Relaxed);
        sessions.insert(peer.clone(), handle);
        Ok(())
    }

    /// Removes a session and wakes the supervisor's dial loop.
    pub fn peer_disconnected(&self, peer: &BtPeer) -> Result<(), PieceStoreError> {
        let mut sessions = self.lock_sessions()?;
        if self.current_peers.load(Ordering::Relaxed) == 0 {
            return Err(PieceStoreError::NoPeersConnected);
        }
        self.current_peers.fetch_sub(1, Ordering::Relaxed);
        self.all_current_peers.fetch_sub(1, Ordering::Relaxed);

        sessions.remove(peer);
        drop(sessions);

        self.notify_peer_disconnected();
        Ok(())
    }

    pub fn is_peer_connected(&self, peer: &BtPeer) -> Result<bool, PieceStoreError> {
        Ok(self.lock_sessions()?.contains_key(peer))
    }

    /// The live sessions, for the choking loop.
    pub fn connected_sessions(&self) -> Result<Vec<(BtPeer, Arc<SessionHandle>)>, PieceStoreError> {
        Ok(self
            .lock_sessions()?
            .iter()
            .map(|(peer, handle)| (peer.clone(), handle.clone()))
            .collect())
    }

    /// Peers connected right now.
    pub fn current_peers(&self) -> usize {
        self.current_peers.load(Ordering::Relaxed)
    }

    /// Peers connected plus peers still connecting.
    pub fn all_current_peers(&self) -> usize {
        self.all_current_peers.load(Ordering::Relaxed)
    }

    /// Aggregate download speed over all sessions, in kilobits per second.
    pub fn torrent_download_speed(&self) -> Result<f64, PieceStoreError> {
        let sessions = self.lock_sessions()?;
        let mut total = 0.0;
        for handle in sessions.values() {
            if let Ok(status) = handle.lock_status() {
                total += status.download_speed;
            }
        }
        Ok(total)
    }

    /// Aggregate upload speed over all sessions, in kilobits per second.
    pub fn torrent_upload_speed(&self) -> Result<f64, PieceStoreError> {
        let sessions = self.lock_sessions()?;
        let mut total = 0.0;
        for handle in sessions.values() {
            if let Ok(status) = handle.lock_status() {
                total += status.upload_speed;
            }
        }
        Ok(total)
    }

    fn broadcast(&self, event: PieceEvent) -> Result<(), PieceStoreError> {
        let sessions = self.lock_sessions()?;
        for handle in sessions.values() {
            if handle.is_alive() {
                handle.notify(event);
            }
        }
        Ok(())
    }

    fn notify_peer_disconnected(&self) {
        // A full channel only means the supervisor is far behind on
        // wakeups, so the notification can be dropped.
        let _ = self
            .disconnect_sender
            .try_send(self.all_current_peers.load(Ordering::Relaxed));
    }

    fn expected_piece_length(&self, index: u32) -> Result<u32, PieceStoreError> {
        if index >= self.torrent.total_pieces() {
            return Err(PieceStoreError::InvalidPieceIndex);
        }
        Ok(self.torrent.effective_piece_length(index))
    }

    fn lock_inner(&self) -> Result<MutexGuard<StoreInner>, PieceStoreError> {
        self.inner
            .lock()
            .map_err(|_| PieceStoreError::PoisonedPieceLock)
    }

    fn lock_output(&self) -> Result<MutexGuard<File>, PieceStoreError> {
        self.output
            .lock()
            .map_err(|_| PieceStoreError::PoisonedFileLock)
    }

    fn lock_sessions(
        &self,
    ) -> Result<MutexGuard<HashMap<BtPeer, Arc<SessionHandle>>>, PieceStoreError> {
        self.sessions
            .lock()
            .map_err(|_| PieceStoreError::PoisonedSessionsLock)
    }
}

/// Losing the output file mid-run leaves nothing worth recovering; the
/// per-peer error discipline does not apply to it.
fn fatal_disk_error(err: std::io::Error) -> ! {
    error!("Output file I/O failed, cannot continue: {:?}", err);
    std::process::exit(1);
}
