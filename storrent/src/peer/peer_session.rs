use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::config::cfg::Cfg;
use crate::torrent_handler::status::{PieceStore, PieceStoreError};
use crate::torrent_handler::work_queue::{WorkQueue, WorkQueueError};
use crate::torrent_parser::torrent::Torrent;

use super::bt_peer::BtPeer;
use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message_receiver::MessageReceiver;
use super::peer_message::{Bitfield, Message};
use super::session_handle::{PieceEvent, SessionHandle, SessionHandleError};
use super::session_status::SessionStatus;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
const IDLE_CUTOFF: Duration = Duration::from_secs(120);
const DRIVER_TICK: Duration = Duration::from_millis(250);
const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
pub enum PeerSessionError {
    InvalidPeerAddress,
    CouldNotConnectToPeer,
    ErrorSettingStreamTimeout,
    HandshakeError,
    InfoHashMismatch,
    PeerIsOurself,
    ErrorCloningStream(io::Error),
    ErrorSpawningReceiver(io::Error),
    PeerTimedOut,
    SessionHandleError(SessionHandleError),
    PieceStoreError(PieceStoreError),
    WorkQueueError(WorkQueueError),
}

/// One connection to one peer, driven to completion on its own thread.
///
/// After the handshake the session splits in two: a receiver thread that
/// frames and dispatches incoming messages, and this driver loop which
/// requests blocks, answers queued REQUESTs, signals interest and keeps
/// the connection alive. Both halves share a [`SessionHandle`].
pub struct PeerSession {
    torrent: Torrent,
    peer: BtPeer,
    store: Arc<PieceStore>,
    work_queue: Arc<WorkQueue>,
    config: Cfg,
    client_peer_id: [u8; 20],
    current_piece: Option<u32>,
}

impl PeerSession {
    pub fn new(
        peer: BtPeer,
        torrent: Torrent,
        store: Arc<PieceStore>,
        work_queue: Arc<WorkQueue>,
        config: Cfg,
        client_peer_id: [u8; 20],
    ) -> Self {
        Self {
            torrent,
            peer,
            store,
            work_queue,
            config,
            client_peer_id,
            current_piece: None,
        }
    }

    /// Dials the peer and exchanges handshakes, blocking the caller for
    /// at most the connect timeout. The caller has already counted the
    /// attempt with `peer_connecting`; a failed dial rolls that back.
    pub fn dial(&mut self) -> Result<TcpStream, PeerSessionError> {
        match self.connect_and_handshake() {
            Ok(stream) => {
                info!("Handshake with {} successful", self.peer.addr());
                Ok(stream)
            }
            Err(err) => {
                self.store.peer_connecting_failed();
                Err(err)
            }
        }
    }

    /// Dials the peer and runs the session until it dies.
    pub fn start_outgoing(&mut self) -> Result<(), PeerSessionError> {
        let stream = self.dial()?;
        self.run(stream)
    }

    /// Runs the session over a connection whose handshake already
    /// happened: one this session dialed, or one the listener accepted
    /// and answered with our handshake and bitfield.
    pub fn run_established(&mut self, stream: TcpStream) -> Result<(), PeerSessionError> {
        self.run(stream)
    }

    /// Connect with a short timeout, exchange 68-byte handshakes and
    /// check that the remote is serving our torrent and is not ourselves.
    fn connect_and_handshake(&mut self) -> Result<TcpStream, PeerSessionError> {
        let addr = self
            .peer
            .addr()
            .to_socket_addrs()
            .map_err(|_| PeerSessionError::InvalidPeerAddress)?
            .next()
            .ok_or(PeerSessionError::InvalidPeerAddress)?;

        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|_| PeerSessionError::CouldNotConnectToPeer)?;
        Self::set_stream_timeouts(&stream, HANDSHAKE_TIMEOUT)?;

        let handshake = Handshake::new(self.torrent.info_hash, self.client_peer_id);
        stream
            .write_all(&handshake.as_bytes())
            .map_err(|_| PeerSessionError::HandshakeError)?;

        let mut response = [0u8; HANDSHAKE_LENGTH];
        stream
            .read_exact(&mut response)
            .map_err(|_| PeerSessionError::HandshakeError)?;
        let received =
            Handshake::from_bytes(&response).map_err(|_| PeerSessionError::HandshakeError)?;

        if received.info_hash != self.torrent.info_hash {
            return Err(PeerSessionError::InfoHashMismatch);
        }
        if received.peer_id == self.client_peer_id {
            return Err(PeerSessionError::PeerIsOurself);
        }
        self.peer.peer_id = Some(received.peer_id.to_vec());

        Ok(stream)
    }

    /// Steady state: registers with the store, spawns the receiver and
    /// drives the session. Whatever way the session ends, the socket is
    /// torn down, an unfinished reserved piece goes back to the queue
    /// head and the store forgets the peer.
    fn run(&mut self, stream: TcpStream) -> Result<(), PeerSessionError> {
        Self::set_stream_timeouts(&stream, RECEIVE_TIMEOUT)?;
        let writer = stream
            .try_clone()
            .map_err(PeerSessionError::ErrorCloningStream)?;

        let (event_sender, events) = sync_channel(EVENT_QUEUE_DEPTH);
        let handle = Arc::new(SessionHandle::new(
            writer,
            SessionStatus::new(Bitfield::for_piece_count(self.torrent.total_pieces())),
            event_sender,
        ));
        self.store
            .peer_connected(&self.peer, handle.clone())
            .map_err(PeerSessionError::PieceStoreError)?;

        let receiver = MessageReceiver::new(
            stream,
            handle.clone(),
            self.store.clone(),
            self.torrent.clone(),
            self.peer.addr(),
        );
        let builder = thread::Builder::new().name(format!(
            "Torrent: {} / Receiver: {}",
            self.torrent.info.name,
            self.peer.addr()
        ));
        let join = match builder.spawn(move || receiver.run()) {
            Ok(join) => join,
            Err(err) => {
                handle.shut_down();
                let _ = self.store.peer_disconnected(&self.peer);
                return Err(PeerSessionError::ErrorSpawningReceiver(err));
            }
        };

        let result = self.drive(&handle, &events);

        handle.shut_down();
        let _ = join.join();
        self.return_reserved_piece();
        self.store
            .peer_disconnected(&self.peer)
            .map_err(PeerSessionError::PieceStoreError)?;

        result
    }

    fn drive(
        &mut self,
        handle: &Arc<SessionHandle>,
        events: &Receiver<PieceEvent>,
    ) -> Result<(), PeerSessionError> {
        let mut last_keepalive = Instant::now();

        loop {
            if !handle.is_alive() {
                return Ok(());
            }
            let finished = self
                .store
                .is_finished()
                .map_err(PeerSessionError::PieceStoreError)?;
            if finished && !self.config.seed_on_complete {
                // announce the final pieces before hanging up
                self.drain_events(handle, events)?;
                return Ok(());
            }
            let idle = handle
                .idle_time()
                .map_err(PeerSessionError::SessionHandleError)?;
            if idle > IDLE_CUTOFF {
                warn!("Peer {} silent for too long, dropping", self.peer.addr());
                return Err(PeerSessionError::PeerTimedOut);
            }

            self.drain_events(handle, events)?;
            self.flush_pending_uploads(handle)?;
            self.update_interest(handle)?;
            if !finished {
                self.request_blocks(handle)?;
            }

            if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
                handle
                    .send_message(&Message::KeepAlive)
                    .map_err(PeerSessionError::SessionHandleError)?;
                last_keepalive = Instant::now();
            }

            thread::sleep(DRIVER_TICK);
        }
    }

    /// Applies verified/rejected piece notifications: announce verified
    /// pieces with HAVE and abandon the current piece when its fate was
    /// decided elsewhere.
    fn drain_events(
        &mut self,
        handle: &Arc<SessionHandle>,
        events: &Receiver<PieceEvent>,
    ) -> Result<(), PeerSessionError> {
        loop {
            match events.try_recv() {
                Ok(PieceEvent::Verified(index)) => {
                    handle
                        .send_message(&Message::Have { index })
                        .map_err(PeerSessionError::SessionHandleError)?;
                    if self.current_piece == Some(index) {
                        self.abandon_current_piece(handle)?;
                    }
                }
                Ok(PieceEvent::Rejected(index)) => {
                    if self.current_piece == Some(index) {
                        self.abandon_current_piece(handle)?;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Sends the PIECE replies the receiver queued for remote REQUESTs.
    /// A reply cancelled in the meantime is suppressed, consuming the
    /// cancellation.
    fn flush_pending_uploads(&mut self, handle: &Arc<SessionHandle>) -> Result<(), PeerSessionError> {
        loop {
            let (index, begin, block) = {
                let mut status = handle
                    .lock_status()
                    .map_err(PeerSessionError::SessionHandleError)?;
                match status.pending_uploads.pop_front() {
                    None => break,
                    Some((index, begin, block)) => {
                        if let Some(at) = status
                            .cancelled
                            .iter()
                            .position(|cancelled| *cancelled == (index, begin))
                        {
                            status.cancelled.remove(at);
                            debug!(
                                "Suppressed cancelled piece {} offset {} for {}",
                                index,
                                begin,
                                self.peer.addr()
                            );
                            continue;
                        }
                        (index, begin, block)
                    }
                }
            };

            let upload_start = Local::now();
            let length = block.len() as u64;
            handle
                .send_message(&Message::Piece {
                    index,
                    begin,
                    block,
                })
                .map_err(PeerSessionError::SessionHandleError)?;

            let speed = kilobits_per_second(upload_start, length);
            let mut status = handle
                .lock_status()
                .map_err(PeerSessionError::SessionHandleError)?;
            status.upload_speed = speed;
            drop(status);
            debug!(
                "Served piece {} offset {} to {}",
                index,
                begin,
                self.peer.addr()
            );
        }
        Ok(())
    }

    /// Sends INTERESTED / NOT_INTERESTED on transitions of "does this
    /// peer have a piece we still need". Redundant sends are suppressed.
    fn update_interest(&mut self, handle: &Arc<SessionHandle>) -> Result<(), PeerSessionError> {
        let (am_interested, bitfield) = {
            let status = handle
                .lock_status()
                .map_err(PeerSessionError::SessionHandleError)?;
            (status.am_interested, status.remote_bitfield.clone())
        };

        let mut needed = self
            .current_piece
            .map_or(false, |index| bitfield.has_piece(index));
        if !needed {
            needed = self
                .work_queue
                .contains(|index| bitfield.has_piece(index))
                .map_err(PeerSessionError::WorkQueueError)?;
        }

        if needed != am_interested {
            let message = if needed {
                Message::Interested
            } else {
                Message::NotInterested
            };
            handle
                .send_message(&message)
                .map_err(PeerSessionError::SessionHandleError)?;
            handle
                .lock_status()
                .map_err(PeerSessionError::SessionHandleError)?
                .am_interested = needed;
            debug!(
                "Now {} in {}",
                if needed { "interested" } else { "not interested" },
                self.peer.addr()
            );
        }
        Ok(())
    }

    /// The requester: reserve a piece this peer has, then keep the
    /// pipeline of block REQUESTs full until the piece completes or the
    /// peer chokes us.
    fn request_blocks(&mut self, handle: &Arc<SessionHandle>) -> Result<(), PeerSessionError> {
        let (peer_choking, am_interested, in_flight, bitfield) = {
            let status = handle
                .lock_status()
                .map_err(PeerSessionError::SessionHandleError)?;
            (
                status.peer_choking,
                status.am_interested,
                status.in_flight,
                status.remote_bitfield.clone(),
            )
        };
        if peer_choking || !am_interested || in_flight >= self.config.pipelining_size {
            return Ok(());
        }

        if self.current_piece.is_none() {
            self.current_piece = self
                .work_queue
                .take_one(|index| bitfield.has_piece(index))
                .map_err(PeerSessionError::WorkQueueError)?;
            if let Some(index) = self.current_piece {
                handle
                    .lock_status()
                    .map_err(PeerSessionError::SessionHandleError)?
                    .requested
                    .clear();
                debug!("Reserved piece {} at {}", index, self.peer.addr());
            }
        }
        let piece = match self.current_piece {
            Some(piece) => piece,
            None => return Ok(()),
        };

        let missing = match self
            .store
            .missing_blocks(piece)
            .map_err(PeerSessionError::PieceStoreError)?
        {
            // another session finished it while we were reserving
            None => {
                self.abandon_current_piece(handle)?;
                return Ok(());
            }
            Some(missing) => missing,
        };

        for (begin, length) in missing {
            let mut status = handle
                .lock_status()
                .map_err(PeerSessionError::SessionHandleError)?;
            if status.peer_choking || status.in_flight >= self.config.pipelining_size {
                break;
            }
            if status.requested.contains(&begin) {
                continue;
            }
            status.in_flight += 1;
            status.requested.insert(begin);
            drop(status);

            if let Err(err) = handle.send_message(&Message::Request {
                index: piece,
                begin,
                length,
            }) {
                // the request never hit the wire, undo the accounting
                let mut status = handle
                    .lock_status()
                    .map_err(PeerSessionError::SessionHandleError)?;
                status.in_flight = status.in_flight.saturating_sub(1);
                status.requested.remove(&begin);
                return Err(PeerSessionError::SessionHandleError(err));
            }
        }
        Ok(())
    }

    fn abandon_current_piece(&mut self, handle: &Arc<SessionHandle>) -> Result<(), PeerSessionError> {
        self.current_piece = None;
        handle
            .lock_status()
            .map_err(PeerSessionError::SessionHandleError)?
            .requested
            .clear();
        Ok(())
    }

    /// A piece still reserved when the session ends goes back to the
    /// front of the queue, unless it made it to verified anyway.
    fn return_reserved_piece(&mut self) {
        if let Some(index) = self.current_piece.take() {
            if let Ok(true) = self.store.is_piece_verified(index) {
                return;
            }
            if let Err(err) = self.work_queue.return_head(index) {
                warn!("Could not return piece {} to the queue: {:?}", index, err);
            }
        }
    }

    fn set_stream_timeouts(
        stream: &TcpStream,
        timeout: Duration,
    ) -> Result<(), PeerSessionError> {
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|_| PeerSessionError::ErrorSettingStreamTimeout)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|_| PeerSessionError::ErrorSettingStreamTimeout)?;
        Ok(())
    }
}

/// Transfer speed of one exchange, the way the tracker-facing stats
/// report it.
fn kilobits_per_second(start_time: DateTime<Local>, bytes: u64) -> f64 {
    let elapsed = Local::now().signed_duration_since(start_time);
    let seconds = match elapsed.num_microseconds() {
        Some(microseconds) => microseconds as f64 / 1_000_000.0,
        None => return 0.0,
    };
    if seconds <= 0.0 {
        return 0.0;
    }
    (bytes as f64 / seconds) * 8.0 / 1024.0
}
