use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::torrent_handler::status::{PieceStore, PieceStoreError};
use crate::torrent_parser::torrent::Torrent;
use crate::BLOCK_SIZE;

use super::peer_message::{Message, MessageError};
use super::session_handle::{SessionHandle, SessionHandleError};

/// The receiving half of a peer session. Owns the read side of the socket
/// and runs on its own thread: frames messages, keeps the liveness clock
/// fresh and dispatches every message kind in one match.
pub struct MessageReceiver {
    stream: TcpStream,
    handle: Arc<SessionHandle>,
    store: Arc<PieceStore>,
    torrent: Torrent,
    peer_name: String,
    expect_bitfield: bool,
    max_frame: usize,
}

#[derive(Debug)]
pub enum MessageReceiverError {
    ReadError(io::Error),
    FrameTooLong(usize),
    MalformedMessage(MessageError),
    /// BITFIELD is only legal as the very first message after the
    /// handshake.
    UnexpectedBitfield,
    /// The bitfield carried more bytes than the torrent has pieces.
    MalformedBitfield,
    SessionHandleError(SessionHandleError),
    PieceStoreError(PieceStoreError),
}

impl MessageReceiver {
    pub fn new(
        stream: TcpStream,
        handle: Arc<SessionHandle>,
        store: Arc<PieceStore>,
        torrent: Torrent,
        peer_name: String,
    ) -> Self {
        // Largest legal frame: a PIECE carrying one block, or the
        // bitfield for this torrent, plus some slack.
        let bitfield_frame = (torrent.total_pieces() as usize + 7) / 8 + 1;
        let max_frame = (BLOCK_SIZE as usize + 9).max(bitfield_frame) + 9;

        Self {
            stream,
            handle,
            store,
            torrent,
            peer_name,
            expect_bitfield: true,
            max_frame,
        }
    }

    /// Reads and dispatches messages until the session dies or the socket
    /// fails. Always leaves the session marked dead on the way out so the
    /// driver loop stops too.
    pub fn run(mut self) {
        loop {
            if !self.handle.is_alive() {
                break;
            }
            match self.read_frame() {
                Ok(None) => continue,
                Ok(Some(message)) => {
                    if self.handle.touch().is_err() {
                        break;
                    }
                    if let Err(err) = self.dispatch(message) {
                        warn!("Dropping peer {}: {:?}", self.peer_name, err);
                        break;
                    }
                }
                Err(MessageReceiverError::ReadError(err)) => {
                    debug!("Connection to {} closed: {:?}", self.peer_name, err);
                    break;
                }
                Err(err) => {
                    warn!("Dropping peer {}: {:?}", self.peer_name, err);
                    break;
                }
            }
        }
        self.handle.shut_down();
    }

    /// Reads one length-prefixed frame. `Ok(None)` is an idle tick: the
    /// read timed out before a length prefix arrived. A timeout in the
    /// middle of a frame is a real error, the stream can't be resynced.
    fn read_frame(&mut self) -> Result<Option<Message>, MessageReceiverError> {
        let mut prefix = [0u8; 4];
        if let Err(err) = self.stream.read_exact(&mut prefix) {
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(None),
                _ => Err(MessageReceiverError::ReadError(err)),
            };
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame {
            return Err(MessageReceiverError::FrameTooLong(length));
        }
        if length == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut body = vec![0; length];
        self.stream
            .read_exact(&mut body)
            .map_err(MessageReceiverError::ReadError)?;

        Message::from_frame(&body)
            .map(Some)
            .map_err(MessageReceiverError::MalformedMessage)
    }

    fn dispatch(&mut self, message: Message) -> Result<(), MessageReceiverError> {
        let first_frame = self.expect_bitfield;
        self.expect_bitfield = false;

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                // Suspends further requests only; blocks already in
                // flight stay accounted until they arrive or the
                // session dies.
                self.lock_status()?.peer_choking = true;
            }
            Message::Unchoke => {
                self.lock_status()?.peer_choking = false;
            }
            Message::Interested => {
                self.lock_status()?.peer_interested = true;
            }
            Message::NotInterested => {
                self.lock_status()?.peer_interested = false;
            }
            Message::Have { index } => {
                self.lock_status()?.remote_bitfield.set_piece(index);
            }
            Message::Bitfield(bitfield) => {
                if !first_frame {
                    return Err(MessageReceiverError::UnexpectedBitfield);
                }
                if bitfield.exceeds(self.torrent.total_pieces()) {
                    return Err(MessageReceiverError::MalformedBitfield);
                }
                self.lock_status()?.remote_bitfield = bitfield;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(index, begin, length)?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.handle_piece(index, begin, &block)?,
            Message::Cancel { index, begin, .. } => {
                self.lock_status()?.cancelled.push((index, begin));
            }
            Message::Port { .. } => {}
        }
        Ok(())
    }

    /// Queues a block for upload unless we are choking the peer (a choked
    /// peer must not request) or the request is not servable.
    fn handle_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), MessageReceiverError> {
        if self.lock_status()?.am_choking {
            debug!(
                "Ignoring request from choked peer {} for piece {}",
                self.peer_name, index
            );
            return Ok(());
        }

        match self.store.read_block(index, begin, length) {
            Ok(block) => {
                self.lock_status()?
                    .pending_uploads
                    .push_back((index, begin, block));
                Ok(())
            }
            Err(
                PieceStoreError::InvalidPieceIndex
                | PieceStoreError::BlockOutOfRange
                | PieceStoreError::PieceNotVerified,
            ) => {
                warn!(
                    "Rejecting request from {}: piece {} offset {} length {}",
                    self.peer_name, index, begin, length
                );
                Ok(())
            }
            Err(err) => Err(MessageReceiverError::PieceStoreError(err)),
        }
    }

    fn handle_piece(
        &mut self,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> Result<(), MessageReceiverError> {
        {
            let mut status = self.lock_status()?;
            status.in_flight = status.in_flight.saturating_sub(1);
        }
        self.handle.add_downloaded(block.len() as u64);

        let result = self
            .store
            .accept_block(index, begin, block)
            .map_err(MessageReceiverError::PieceStoreError)?;
        debug!(
            "Block piece {} offset {} from {}: {:?}",
            index, begin, self.peer_name, result
        );
        Ok(())
    }

    fn lock_status(
        &self,
    ) -> Result<std::sync::MutexGuard<super::session_status::SessionStatus>, MessageReceiverError>
    {
        self.handle
            .lock_status()
            .map_err(MessageReceiverError::SessionHandleError)
    }
}
