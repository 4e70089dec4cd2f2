use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::config::cfg::Cfg;
use crate::peer::peer_message::Message;
use crate::peer::session_handle::{SessionHandle, SessionHandleError};
use crate::torrent_handler::status::{PieceStore, PieceStoreError};

/// Reciprocation period.
const CHOKE_TICK: Duration = Duration::from_secs(10);
/// Every third tick one extra random peer gets the optimistic slot.
const OPTIMISTIC_TICKS: u64 = 3;

/// The global choking loop: every tick it measures each session's
/// download rate, unchokes the fastest interested peers plus a periodic
/// optimistic pick, and chokes everybody else. Only edges are sent on the
/// wire, a peer already in the right state hears nothing.
pub struct Choker {
    store: Arc<PieceStore>,
    config: Cfg,
    period: Duration,
}

#[derive(Debug)]
pub enum ChokerError {
    PieceStoreError(PieceStoreError),
    SessionHandleError(SessionHandleError),
}

impl Choker {
    pub fn new(store: Arc<PieceStore>, config: Cfg) -> Self {
        Self::with_period(store, config, CHOKE_TICK)
    }

    /// Same loop with a custom tick, for tests.
    pub fn with_period(store: Arc<PieceStore>, config: Cfg, period: Duration) -> Self {
        Self {
            store,
            config,
            period,
        }
    }

    /// Runs until the download completes (unless we stay to seed). A
    /// failed tick is logged and the loop carries on; choking decisions
    /// are never fatal.
    pub fn run(&self) {
        let mut round: u64 = 0;
        loop {
            thread::sleep(self.period);
            round += 1;

            match self.store.is_finished() {
                Ok(true) if !self.config.seed_on_complete => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("Choking loop lost the piece store: {:?}", err);
                    break;
                }
            }

            if let Err(err) = self.run_once(round) {
                warn!("Choke tick failed: {:?}", err);
            }
        }
    }

    /// One reciprocation tick. Rates are refreshed for every alive
    /// session, interested or not, so a peer flipping to interested later
    /// does not start with a stale window.
    pub fn run_once(&self, round: u64) -> Result<(), ChokerError> {
        let sessions = self
            .store
            .connected_sessions()
            .map_err(ChokerError::PieceStoreError)?;
        let alive: Vec<Arc<SessionHandle>> = sessions
            .into_iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(_, handle)| handle)
            .collect();
        if alive.is_empty() {
            return Ok(());
        }

        let period_seconds = self.period.as_secs_f64();
        let mut rated: Vec<(f64, bool)> = Vec::with_capacity(alive.len());
        for handle in &alive {
            let rate = handle.take_download_rate(period_seconds);
            let interested = handle
                .is_peer_interested()
                .map_err(ChokerError::SessionHandleError)?;
            let mut status = handle
                .lock_status()
                .map_err(ChokerError::SessionHandleError)?;
            status.download_speed = rate * 8.0 / 1024.0;
            drop(status);
            rated.push((rate, interested));
        }

        let slots = if self.config.unchoke_all_interested {
            usize::MAX
        } else {
            self.config.unchoke_slots
        };
        let mut unchoked = reciprocated(&rated, slots);

        if round % OPTIMISTIC_TICKS == 0 {
            let candidates: Vec<usize> = (0..alive.len())
                .filter(|at| !unchoked.contains(at))
                .collect();
            if let Some(pick) = candidates.choose(&mut rand::thread_rng()) {
                unchoked.push(*pick);
                debug!("Optimistic unchoke slot for session {}", pick);
            }
        }

        for (at, handle) in alive.iter().enumerate() {
            let should_unchoke = unchoked.contains(&at);
            let am_choking = handle
                .am_choking()
                .map_err(ChokerError::SessionHandleError)?;

            if should_unchoke && am_choking {
                handle
                    .set_am_choking(false)
                    .map_err(ChokerError::SessionHandleError)?;
                if handle.send_message(&Message::Unchoke).is_err() {
                    debug!("Session died while being unchoked");
                }
            } else if !should_unchoke && !am_choking {
                handle
                    .set_am_choking(true)
                    .map_err(ChokerError::SessionHandleError)?;
                if handle.send_message(&Message::Choke).is_err() {
                    debug!("Session died while being choked");
                }
            }
        }
        Ok(())
    }
}

/// Indices of the interested sessions with the highest download rates,
/// at most `slots` of them.
fn reciprocated(rated: &[(f64, bool)], slots: usize) -> Vec<usize> {
    let mut interested: Vec<usize> = (0..rated.len())
        .filter(|at| rated[*at].1)
        .collect();
    interested.sort_by(|a, b| {
        rated[*b]
            .0
            .partial_cmp(&rated[*a].0)
            .unwrap_or(Ordering::Equal)
    });
    interested.truncate(slots);
    interested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::bt_peer::BtPeer;
    use crate::peer::peer_message::Bitfield;
    use crate::peer::session_status::SessionStatus;
    use crate::torrent_parser::info::Info;
    use crate::torrent_parser::torrent::Torrent;
    use crate::torrent_handler::work_queue::WorkQueue;
    use sha1::{Digest, Sha1};
    use std::fs;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_reciprocated_picks_the_three_fastest() {
        let rated = vec![
            (100.0, true),
            (80.0, true),
            (60.0, true),
            (40.0, true),
            (20.0, true),
        ];

        assert_eq!(reciprocated(&rated, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_reciprocated_ignores_uninterested_peers() {
        let rated = vec![(100.0, false), (80.0, true), (60.0, true), (40.0, true)];

        assert_eq!(reciprocated(&rated, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_reciprocated_with_fewer_interested_than_slots() {
        let rated = vec![(100.0, false), (80.0, true), (60.0, false)];

        assert_eq!(reciprocated(&rated, 3), vec![1]);
    }

    #[test]
    fn test_reciprocated_unbounded_takes_every_interested_peer() {
        let rated = vec![(10.0, true), (20.0, true), (30.0, true), (40.0, true)];

        assert_eq!(reciprocated(&rated, usize::MAX), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_run_once_unchokes_top_rates_and_chokes_the_rest() {
        let (store, dir) = build_store("choker_top");
        let rates = [100_000u64, 80_000, 60_000, 40_000, 20_000];
        let mut far_ends = Vec::new();

        for (at, rate) in rates.iter().enumerate() {
            let peer = BtPeer::new("127.0.0.1".to_string(), 6000 + at as u16);
            let (handle, far) = loopback_handle();
            handle.lock_status().unwrap().peer_interested = true;
            handle.add_downloaded(*rate);
            store.peer_connected(&peer, handle.clone()).unwrap();
            far_ends.push((handle, far));
        }

        let choker = Choker::with_period(store.clone(), test_config(&dir), CHOKE_TICK);
        choker.run_once(1).unwrap();

        let mut unchoked = 0;
        for (handle, far) in &mut far_ends {
            if !handle.am_choking().unwrap() {
                unchoked += 1;
                assert_eq!(read_frame(far), vec![0, 0, 0, 1, 1]);
            }
        }
        assert_eq!(unchoked, 3);
        // the three fastest are the ones unchoked
        assert!(!far_ends[0].0.am_choking().unwrap());
        assert!(!far_ends[1].0.am_choking().unwrap());
        assert!(!far_ends[2].0.am_choking().unwrap());

        cleanup(dir);
    }

    #[test]
    fn test_third_tick_adds_an_optimistic_peer() {
        let (store, dir) = build_store("choker_optimistic");
        let rates = [100_000u64, 80_000, 60_000, 40_000, 20_000];
        let mut handles = Vec::new();

        for (at, rate) in rates.iter().enumerate() {
            let peer = BtPeer::new("127.0.0.1".to_string(), 6100 + at as u16);
            let (handle, far) = loopback_handle();
            handle.lock_status().unwrap().peer_interested = true;
            handle.add_downloaded(*rate);
            store.peer_connected(&peer, handle.clone()).unwrap();
            handles.push((handle, far));
        }

        let choker = Choker::with_period(store.clone(), test_config(&dir), CHOKE_TICK);
        choker.run_once(3).unwrap();

        let unchoked: Vec<usize> = (0..handles.len())
            .filter(|at| !handles[*at].0.am_choking().unwrap())
            .collect();
        assert_eq!(unchoked.len(), 4);
        assert!(unchoked.contains(&0));
        assert!(unchoked.contains(&1));
        assert!(unchoked.contains(&2));
        // the fourth slot went to one of the two slow peers
        assert!(unchoked.contains(&3) || unchoked.contains(&4));

        cleanup(dir);
    }

    #[test]
    fn test_losing_an_unchoke_sends_choke() {
        let (store, dir) = build_store("choker_demote");

        let peer = BtPeer::new("127.0.0.1".to_string(), 6200);
        let (handle, mut far) = loopback_handle();
        handle.lock_status().unwrap().peer_interested = true;
        store.peer_connected(&peer, handle.clone()).unwrap();

        let choker = Choker::with_period(store.clone(), test_config(&dir), CHOKE_TICK);
        choker.run_once(1).unwrap();
        assert!(!handle.am_choking().unwrap());
        assert_eq!(read_frame(&mut far), vec![0, 0, 0, 1, 1]);

        // the peer loses interest; next tick it must be choked again
        handle.lock_status().unwrap().peer_interested = false;
        choker.run_once(2).unwrap();
        assert!(handle.am_choking().unwrap());
        assert_eq!(read_frame(&mut far), vec![0, 0, 0, 1, 0]);

        cleanup(dir);
    }

    // Auxiliary functions

    fn build_store(name: &str) -> (Arc<PieceStore>, PathBuf) {
        let content = vec![1u8; 8];
        let mut digests = Vec::new();
        for chunk in content.chunks(8) {
            digests.extend(Sha1::digest(chunk));
        }
        let torrent = Torrent {
            announce_url: "http://tracker.example/announce".to_string(),
            info: Info {
                length: 8,
                name: "example".to_string(),
                piece_length: 8,
                pieces: digests,
                private: None,
            },
            info_hash: [0; 20],
        };

        let dir = std::env::temp_dir().join(format!("storrent_{}", name));
        let queue = Arc::new(WorkQueue::new(torrent.total_pieces()));
        let (store, _receiver) =
            PieceStore::new(&torrent, test_config(&dir), queue).unwrap();
        (Arc::new(store), dir)
    }

    fn test_config(dir: &PathBuf) -> Cfg {
        Cfg {
            tcp_port: 6881,
            download_directory: dir.to_str().unwrap().to_string(),
            pipelining_size: 5,
            max_peers_per_torrent: 10,
            seed_on_complete: false,
            unchoke_slots: 3,
            unchoke_all_interested: false,
        }
    }

    fn loopback_handle() -> (Arc<SessionHandle>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let near = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (far, _) = listener.accept().unwrap();
        far.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let (sender, _receiver) = sync_channel(16);
        let handle = Arc::new(SessionHandle::new(
            near,
            SessionStatus::new(Bitfield::for_piece_count(8)),
            sender,
        ));
        (handle, far)
    }

    fn read_frame(far: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 5];
        far.read_exact(&mut buf).unwrap();
        buf
    }

    fn cleanup(dir: PathBuf) {
        let _ = fs::remove_dir_all(dir);
    }
}
