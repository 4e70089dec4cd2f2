use std::collections::HashSet;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bt_server::server::BtServer;
use crate::config::cfg::Cfg;
use crate::peer::bt_peer::BtPeer;
use crate::peer::peer_session::PeerSession;
use crate::torrent_handler::choker::Choker;
use crate::torrent_handler::status::{PieceStore, PieceStoreError};
use crate::torrent_handler::work_queue::WorkQueue;
use crate::torrent_parser::torrent::Torrent;
use crate::tracker::http::query_params::AnnounceEvent;
use crate::tracker::tracker_handler::{TrackerHandler, TrackerHandlerError};

/// How long to wait before retrying a failed announce.
const ANNOUNCE_RETRY: Duration = Duration::from_secs(10);
/// Bounds on how long to sit between announce waves, whatever interval
/// the tracker asks for.
const MIN_REANNOUNCE: i64 = 10;
const MAX_REANNOUNCE: i64 = 60;

/// The supervisor of one torrent: announces, dials peers, and runs the
/// choking loop and the listener, until the download completes.
///
/// To create a new `TorrentHandler`, use TorrentHandler::new(torrent,
/// config, client_peer_id).
#[derive(Debug)]
pub struct TorrentHandler {
    torrent: Torrent,
    config: Cfg,
    store: Arc<PieceStore>,
    work_queue: Arc<WorkQueue>,
    disconnect_receiver: Receiver<usize>,
    client_peer_id: [u8; 20],
}

/// Posible torrent handler errors.
#[derive(Debug)]
pub enum TorrentHandlerError {
    TrackerError(TrackerHandlerError),
    PieceStoreError(PieceStoreError),
    DisconnectChannelClosed,
    ErrorSpawningThread(std::io::Error),
}

impl TorrentHandler {
    pub fn new(
        torrent: Torrent,
        config: Cfg,
        client_peer_id: [u8; 20],
    ) -> Result<Self, TorrentHandlerError> {
        let work_queue = Arc::new(WorkQueue::new(torrent.total_pieces()));
        let (store, disconnect_receiver) =
            PieceStore::new(&torrent, config.clone(), work_queue.clone())
                .map_err(TorrentHandlerError::PieceStoreError)?;

        Ok(Self {
            store: Arc::new(store),
            torrent,
            config,
            work_queue,
            disconnect_receiver,
            client_peer_id,
        })
    }

    /// The piece store, shared with whoever wants progress numbers.
    pub fn status(&self) -> Arc<PieceStore> {
        self.store.clone()
    }

    /// Runs the torrent to completion: announce, dial, repeat. When the
    /// download finishes the tracker hears `completed`; then we either
    /// stay to seed or announce `stopped` and return.
    pub fn handle(&mut self) -> Result<(), TorrentHandlerError> {
        let tracker = TrackerHandler::new(
            self.torrent.clone(),
            self.config.tcp_port,
            self.client_peer_id,
        )
        .map_err(TorrentHandlerError::TrackerError)?;
        info!("Announcing to tracker at {}", self.torrent.announce_url);

        self.spawn_choker()?;
        self.spawn_listener()?;

        let mut event = AnnounceEvent::Started;
        while !self.is_finished()? {
            let counters = self
                .store
                .counters()
                .map_err(TorrentHandlerError::PieceStoreError)?;
            let response = match tracker.announce(event, &counters) {
                Ok(response) => {
                    event = AnnounceEvent::None;
                    response
                }
                Err(err) => {
                    warn!("Announce failed: {:?}", err);
                    thread::sleep(ANNOUNCE_RETRY);
                    continue;
                }
            };
            info!(
                "Tracker returned {} peers ({} seeders / {} leechers)",
                response.peers.len(),
                response.complete,
                response.incomplete
            );

            self.connect_to_peers(dedupe_peers(response.peers))?;
            self.log_progress();

            let wait = response.interval.clamp(MIN_REANNOUNCE, MAX_REANNOUNCE);
            for _ in 0..wait {
                if self.is_finished()? {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
            }
        }

        let counters = self
            .store
            .counters()
            .map_err(TorrentHandlerError::PieceStoreError)?;
        if let Err(err) = tracker.announce(AnnounceEvent::Completed, &counters) {
            warn!("Completed announce failed: {:?}", err);
        }
        info!("Torrent {} downloaded", self.torrent.name());

        if self.config.seed_on_complete {
            info!("Staying in seed mode, interrupt to quit");
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }

        if let Err(err) = tracker.announce(AnnounceEvent::Stopped, &counters) {
            warn!("Stopped announce failed: {:?}", err);
        }
        Ok(())
    }

    /// Dials a wave of peers sequentially, respecting the peer cap by
    /// blocking on the disconnect channel until a slot frees up.
    fn connect_to_peers(&mut self, peers: Vec<BtPeer>) -> Result<(), TorrentHandlerError> {
        for peer in peers {
            if self.is_finished()? {
                break;
            }

            // If we reached the maximum number of simultaneous peers, wait
            // until the store tells us somebody left. The drain loop keeps
            // multiple simultaneous disconnects from over-waking us.
            while self.store.all_current_peers() >= self.config.max_peers_per_torrent as usize {
                self.disconnect_receiver
                    .recv()
                    .map_err(|_| TorrentHandlerError::DisconnectChannelClosed)?;
                while self
                    .disconnect_receiver
                    .recv_timeout(Duration::from_nanos(1))
                    .is_ok()
                {
                    continue;
                }
            }

            if self
                .store
                .is_peer_connected(&peer)
                .map_err(TorrentHandlerError::PieceStoreError)?
            {
                continue;
            }

            self.connect_to_peer(peer)?;
        }
        Ok(())
    }

    /// One blocking dial; a successful handshake gets its own session
    /// thread, a failed one is just logged.
    fn connect_to_peer(&mut self, peer: BtPeer) -> Result<(), TorrentHandlerError> {
        self.store.peer_connecting();
        let mut session = PeerSession::new(
            peer.clone(),
            self.torrent.clone(),
            self.store.clone(),
            self.work_queue.clone(),
            self.config.clone(),
            self.client_peer_id,
        );

        let stream = match session.dial() {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Could not reach {}: {:?}", peer.addr(), err);
                return Ok(());
            }
        };

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
        if let Err(err) = join {
            error!("Could not spawn session thread: {:?}", err);
            self.store.peer_connecting_failed();
        }
        Ok(())
    }

    fn spawn_choker(&self) -> Result<(), TorrentHandlerError> {
        let choker = Choker::new(self.store.clone(), self.config.clone());
        thread::Builder::new()
            .name(format!("Torrent: {} / Choker", self.torrent.info.name))
            .spawn(move || choker.run())
            .map_err(TorrentHandlerError::ErrorSpawningThread)?;
        Ok(())
    }

    fn spawn_listener(&self) -> Result<(), TorrentHandlerError> {
        let server = BtServer::new(
            self.torrent.clone(),
            self.store.clone(),
            self.work_queue.clone(),
            self.config.clone(),
            self.client_peer_id,
        );
        thread::Builder::new()
            .name(format!("Torrent: {} / Listener", self.torrent.info.name))
            .spawn(move || {
                if let Err(err) = server.init() {
                    error!("Listener failed: {:?}", err);
                }
            })
            .map_err(TorrentHandlerError::ErrorSpawningThread)?;
        Ok(())
    }

    fn is_finished(&self) -> Result<bool, TorrentHandlerError> {
        self.store
            .is_finished()
            .map_err(TorrentHandlerError::PieceStoreError)
    }

    fn log_progress(&self) {
        let pieces = self.store.downloaded_pieces().unwrap_or(0);
        let down = self.store.torrent_download_speed().unwrap_or(0.0);
        let up = self.store.torrent_upload_speed().unwrap_or(0.0);
        info!(
            "*** Torrent: {} - {}/{} pieces - down {:.1} kb/s, up {:.1} kb/s, {} peers",
            self.torrent.name(),
            pieces,
            self.torrent.total_pieces(),
            down,
            up,
            self.store.current_peers()
        );
    }
}

/// Drops repeated `(ip, port)` entries, keeping first occurrences in
/// order.
fn dedupe_peers(peers: Vec<BtPeer>) -> Vec<BtPeer> {
    let mut seen = HashSet::new();
    peers
        .into_iter()
        .filter(|peer| seen.insert(peer.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::Info;
    use std::fs;

    #[test]
    fn test_dedupe_peers_keeps_first_occurrence() {
        let peers = vec![
            BtPeer::new("10.0.0.1".to_string(), 6881),
            BtPeer::new("10.0.0.2".to_string(), 6881),
            BtPeer::new("10.0.0.1".to_string(), 6881),
            BtPeer::new("10.0.0.1".to_string(), 6882),
        ];

        let deduped = dedupe_peers(peers);

        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].addr(), "10.0.0.1:6881");
        assert_eq!(deduped[1].addr(), "10.0.0.2:6881");
        assert_eq!(deduped[2].addr(), "10.0.0.1:6882");
    }

    #[test]
    fn test_new_seeds_the_work_queue_and_creates_the_file() {
        let dir = std::env::temp_dir().join("storrent_handler_new");
        let torrent = Torrent {
            announce_url: "http://tracker.example/announce".to_string(),
            info: Info {
                length: 64,
                name: "example".to_string(),
                piece_length: 16,
                pieces: vec![0; 4 * 20],
                private: None,
            },
            info_hash: [0; 20],
        };
        let config = Cfg {
            tcp_port: 6881,
            download_directory: dir.to_str().unwrap().to_string(),
            pipelining_size: 5,
            max_peers_per_torrent: 10,
            seed_on_complete: false,
            unchoke_slots: 3,
            unchoke_all_interested: false,
        };

        let handler = TorrentHandler::new(torrent, config, [1; 20]).unwrap();

        assert_eq!(handler.work_queue.len().unwrap(), 4);
        assert!(dir.join("example").exists());
        assert!(!handler.status().is_finished().unwrap());

        let _ = fs::remove_dir_all(dir);
    }
}
