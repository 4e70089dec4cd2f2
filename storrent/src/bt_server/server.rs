use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::cfg::Cfg;
use crate::peer::bt_peer::BtPeer;
use crate::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
use crate::peer::peer_message::Message;
use crate::peer::peer_session::PeerSession;
use crate::torrent_handler::status::{PieceStore, PieceStoreError};
use crate::torrent_handler::work_queue::WorkQueue;
use crate::torrent_parser::torrent::Torrent;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Accepts inbound peers: validates their handshake, answers with ours
/// plus our current bitfield, and hands the connection to a regular peer
/// session. Malformed or foreign handshakes are closed without a reply.
#[derive(Debug)]
pub struct BtServer {
    torrent: Torrent,
    config: Cfg,
    store: Arc<PieceStore>,
    work_queue: Arc<WorkQueue>,
    client_peer_id: [u8; 20],
}

/// Posible `BtServer` errors.
#[derive(Debug)]
pub enum BtServerError {
    OpeningListenerError(std::io::Error),
    HandleConnectionError(std::io::Error),
    ErrorSettingStreamTimeout,
    InvalidHandshake,
    WrongInfoHash,
    MaxPeersConnectedReached,
    PieceStoreError(PieceStoreError),
    ErrorSpawningSession(std::io::Error),
}

impl BtServer {
    pub fn new(
        torrent: Torrent,
        store: Arc<PieceStore>,
        work_queue: Arc<WorkQueue>,
        config: Cfg,
        client_peer_id: [u8; 20],
    ) -> Self {
        Self {
            torrent,
            config,
            store,
            work_queue,
            client_peer_id,
        }
    }

    /// Binds the configured port and accepts connections until the
    /// process ends. Per-connection failures are logged and survived.
    pub fn init(&self) -> Result<(), BtServerError> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.config.tcp_port))
            .map_err(BtServerError::OpeningListenerError)?;

        info!("Listening for peers on port {}", self.config.tcp_port);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => match self.handle_connection(stream) {
                    Ok(_) => (),
                    Err(err) => warn!("Couldn't handle incoming connection: {:?}", err),
                },
                Err(err) => warn!("Couldn't handle incoming connection: {:?}", err),
            }
        }

        Ok(())
    }

    /// Handshake-responder role: read and validate the remote's 68 bytes,
    /// reply with handshake plus BITFIELD, then run a session thread.
    pub fn handle_connection(&self, mut stream: TcpStream) -> Result<(), BtServerError> {
        let addr = stream
            .peer_addr()
            .map_err(BtServerError::HandleConnectionError)?;
        self.set_stream_timeouts(&mut stream)?;

        let mut buffer = [0u8; HANDSHAKE_LENGTH];
        stream
            .read_exact(&mut buffer)
            .map_err(|_| BtServerError::InvalidHandshake)?;
        let handshake =
            Handshake::from_bytes(&buffer).map_err(|_| BtServerError::InvalidHandshake)?;

        if handshake.info_hash != self.torrent.info_hash {
            return Err(BtServerError::WrongInfoHash);
        }

        if self.store.all_current_peers() >= self.config.max_peers_per_torrent as usize {
            return Err(BtServerError::MaxPeersConnectedReached);
        }

        let reply = Handshake::new(self.torrent.info_hash, self.client_peer_id);
        stream
            .write_all(&reply.as_bytes())
            .map_err(BtServerError::HandleConnectionError)?;

        let bitfield = self
            .store
            .local_bitfield()
            .map_err(BtServerError::PieceStoreError)?;
        stream
            .write_all(&Message::Bitfield(bitfield).to_bytes())
            .map_err(BtServerError::HandleConnectionError)?;

        let mut peer = BtPeer::new(addr.ip().to_string(), addr.port());
        peer.peer_id = Some(handshake.peer_id.to_vec());
        info!("Accepted incoming peer {}", peer.addr());

        self.store.peer_connecting();
        let mut session = PeerSession::new(
            peer.clone(),
            self.torrent.clone(),
            self.store.clone(),
            self.work_queue.clone(),
            self.config.clone(),
            self.client_peer_id,
        );

        let peer_name = peer.addr();
        let builder = thread::Builder::new().name(format!(
            "Torrent: {} / Peer: {}",
            self.torrent.info.name, peer_name
        ));
        let join = builder.spawn(move || {
            if let Err(err) = session.run_established(stream) {
                warn!("Session with {} ended: {:?}", peer_name, err);
            }
        });
        match join {
            Ok(_) => Ok(()),
            Err(err) => {
                self.store.peer_connecting_failed();
                Err(BtServerError::ErrorSpawningSession(err))
            }
        }
    }

    fn set_stream_timeouts(&self, stream: &mut TcpStream) -> Result<(), BtServerError> {
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(|_| BtServerError::ErrorSettingStreamTimeout)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(|_| BtServerError::ErrorSettingStreamTimeout)?;
        Ok(())
    }
}
