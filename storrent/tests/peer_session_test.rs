use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sha1::{Digest, Sha1};

use storrent::config::cfg::Cfg;
use storrent::peer::bt_peer::BtPeer;
use storrent::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
use storrent::peer::peer_message::{Bitfield, Message};
use storrent::peer::peer_session::PeerSession;
use storrent::torrent_handler::status::PieceStore;
use storrent::torrent_handler::work_queue::WorkQueue;
use storrent::torrent_parser::info::Info;
use storrent::torrent_parser::torrent::Torrent;

const BLOCK: usize = 16_384;

#[test]
fn test_single_peer_happy_path() {
    let content = patterned(2 * BLOCK);
    let fixture = build_fixture("it_happy_path", &content, BLOCK as i64);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let torrent = fixture.torrent.clone();
    let served = content.clone();
    let seeder = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        exchange_handshake(&mut stream, &torrent);
        send(&mut stream, &Message::Bitfield(Bitfield::new(vec![0b1100_0000])));

        let mut haves = 0;
        let mut served_blocks = 0;
        while let Some(message) = try_read_message(&mut stream) {
            match message {
                Message::Interested => send(&mut stream, &Message::Unchoke),
                Message::Request {
                    index,
                    begin,
                    length,
                } => {
                    let start = index as usize * BLOCK + begin as usize;
                    let block = served[start..start + length as usize].to_vec();
                    send(
                        &mut stream,
                        &Message::Piece {
                            index,
                            begin,
                            block,
                        },
                    );
                    served_blocks += 1;
                }
                Message::Have { .. } => haves += 1,
                _ => {}
            }
        }
        (haves, served_blocks)
    });

    run_leech_session(&fixture, addr.port()).unwrap();

    let (haves, served_blocks) = seeder.join().unwrap();
    assert_eq!(haves, 2);
    assert_eq!(served_blocks, 2);

    let on_disk = fs::read(fixture.dir.join("example")).unwrap();
    assert_eq!(on_disk, content);

    let counters = fixture.store.counters().unwrap();
    assert_eq!(counters.downloaded, 2 * BLOCK as u64);
    assert_eq!(counters.left, 0);
    assert!(fixture.queue.is_empty().unwrap());

    cleanup(fixture.dir);
}

#[test]
fn test_hash_mismatch_rolls_back_and_another_peer_retries() {
    let content = patterned(2 * BLOCK);
    let fixture = build_fixture("it_retry", &content, BLOCK as i64);

    // peer A owns only piece 0 and serves it corrupted, then hangs up
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr_a = listener.local_addr().unwrap();
    let torrent = fixture.torrent.clone();
    let corrupting_seeder = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        exchange_handshake(&mut stream, &torrent);
        send(&mut stream, &Message::Bitfield(Bitfield::new(vec![0b1000_0000])));

        while let Some(message) = try_read_message(&mut stream) {
            match message {
                Message::Interested => send(&mut stream, &Message::Unchoke),
                Message::Request { index, begin, length } => {
                    send(
                        &mut stream,
                        &Message::Piece {
                            index,
                            begin,
                            block: vec![0xff; length as usize],
                        },
                    );
                    break; // one corrupt block, then disconnect
                }
                _ => {}
            }
        }
    });

    // the session ends when peer A hangs up; success or error depends on
    // which half notices first
    let _ = run_leech_session(&fixture, addr_a.port());
    corrupting_seeder.join().unwrap();

    // the corrupt piece was rolled back and requeued
    let counters = fixture.store.counters().unwrap();
    assert_eq!(counters.downloaded, 0);
    assert_eq!(counters.left, 2 * BLOCK as u64);
    assert_eq!(fixture.queue.len().unwrap(), 2);
    assert!(fixture.queue.contains(|index| index == 0).unwrap());

    // peer B has everything and serves honest data
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr_b = listener.local_addr().unwrap();
    let torrent = fixture.torrent.clone();
    let served = content.clone();
    let honest_seeder = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        exchange_handshake(&mut stream, &torrent);
        send(&mut stream, &Message::Bitfield(Bitfield::new(vec![0b1100_0000])));

        while let Some(message) = try_read_message(&mut stream) {
            match message {
                Message::Interested => send(&mut stream, &Message::Unchoke),
                Message::Request {
                    index,
                    begin,
                    length,
                } => {
                    let start = index as usize * BLOCK + begin as usize;
                    send(
                        &mut stream,
                        &Message::Piece {
                            index,
                            begin,
                            block: served[start..start + length as usize].to_vec(),
                        },
                    );
                }
                _ => {}
            }
        }
    });

    run_leech_session(&fixture, addr_b.port()).unwrap();
    honest_seeder.join().unwrap();

    let on_disk = fs::read(fixture.dir.join("example")).unwrap();
    assert_eq!(on_disk, content);
    assert!(fixture.store.is_finished().unwrap());

    cleanup(fixture.dir);
}

#[test]
fn test_choke_suspends_and_unchoke_resumes_the_piece() {
    // one piece of four blocks
    let content = patterned(4 * BLOCK);
    let fixture = build_fixture("it_choke_resume", &content, 4 * BLOCK as i64);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let torrent = fixture.torrent.clone();
    let served = content.clone();
    let seeder = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        exchange_handshake(&mut stream, &torrent);
        send(&mut stream, &Message::Bitfield(Bitfield::new(vec![0b1000_0000])));

        let mut served_blocks = 0;
        let mut choked_once = false;
        let mut haves = 0;
        while let Some(message) = try_read_message(&mut stream) {
            match message {
                Message::Interested => send(&mut stream, &Message::Unchoke),
                Message::Request {
                    index,
                    begin,
                    length,
                } => {
                    send(
                        &mut stream,
                        &Message::Piece {
                            index,
                            begin,
                            block: served[begin as usize..(begin + length) as usize].to_vec(),
                        },
                    );
                    served_blocks += 1;

                    if served_blocks == 3 && !choked_once {
                        // stall the download mid-piece, then let it resume
                        choked_once = true;
                        send(&mut stream, &Message::Choke);
                        thread::sleep(Duration::from_millis(800));
                        send(&mut stream, &Message::Unchoke);
                    }
                }
                Message::Have { .. } => haves += 1,
                _ => {}
            }
        }
        (haves, choked_once)
    });

    run_leech_session(&fixture, addr.port()).unwrap();

    let (haves, choked_once) = seeder.join().unwrap();
    assert!(choked_once);
    assert_eq!(haves, 1);

    let on_disk = fs::read(fixture.dir.join("example")).unwrap();
    assert_eq!(on_disk, content);
    assert_eq!(fixture.store.counters().unwrap().left, 0);

    cleanup(fixture.dir);
}

#[test]
fn test_pipeline_is_capped_and_dead_peer_returns_the_piece() {
    // one piece of six blocks, so the cap binds
    let content = patterned(6 * BLOCK);
    let fixture = build_fixture("it_pipeline_cap", &content, 6 * BLOCK as i64);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let fixture_store = fixture.store.clone();
    let fixture_queue = fixture.queue.clone();
    let torrent = fixture.torrent.clone();
    let config = fixture.config.clone();
    let port = addr.port();
    let leech = thread::spawn(move || {
        let peer = BtPeer::new("127.0.0.1".to_string(), port);
        fixture_store.peer_connecting();
        let mut session = PeerSession::new(
            peer,
            torrent,
            fixture_store,
            fixture_queue,
            config,
            [1; 20],
        );
        session.start_outgoing()
    });

    let (mut stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    exchange_handshake(&mut stream, &fixture.torrent);
    send(&mut stream, &Message::Bitfield(Bitfield::new(vec![0b1000_0000])));

    // unchoke but never serve anything
    let mut requests = 0;
    while let Some(message) = try_read_message(&mut stream) {
        match message {
            Message::Interested => send(&mut stream, &Message::Unchoke),
            Message::Request { .. } => requests += 1,
            _ => {}
        }
    }
    // the read loop above ends on the 2 s timeout: the requester went
    // quiet after filling its pipeline
    assert_eq!(requests, 5);

    // hang up; the leech must notice and put the piece back
    drop(stream);
    leech.join().unwrap().unwrap();

    assert_eq!(fixture.store.counters().unwrap().downloaded, 0);
    assert_eq!(fixture.queue.len().unwrap(), 1);
    assert!(fixture.queue.contains(|index| index == 0).unwrap());

    cleanup(fixture.dir);
}

// Auxiliary functions

struct Fixture {
    torrent: Torrent,
    config: Cfg,
    store: Arc<PieceStore>,
    queue: Arc<WorkQueue>,
    dir: PathBuf,
}

fn build_fixture(name: &str, content: &[u8], piece_length: i64) -> Fixture {
    let mut digests = Vec::new();
    for chunk in content.chunks(piece_length as usize) {
        digests.extend(Sha1::digest(chunk));
    }

    let torrent = Torrent {
        announce_url: "http://tracker.example/announce".to_string(),
        info: Info {
            length: content.len() as i64,
            name: "example".to_string(),
            piece_length,
            pieces: digests,
            private: None,
        },
        info_hash: [7; 20],
    };

    let dir = std::env::temp_dir().join(format!("storrent_{}", name));
    let config = Cfg {
        tcp_port: 6881,
        download_directory: dir.to_str().unwrap().to_string(),
        pipelining_size: 5,
        max_peers_per_torrent: 10,
        seed_on_complete: false,
        unchoke_slots: 3,
        unchoke_all_interested: false,
    };

    let queue = Arc::new(WorkQueue::new(torrent.total_pieces()));
    let (store, _receiver) = PieceStore::new(&torrent, config.clone(), queue.clone()).unwrap();

    Fixture {
        torrent,
        config,
        store: Arc::new(store),
        queue,
        dir,
    }
}

fn run_leech_session(
    fixture: &Fixture,
    port: u16,
) -> Result<(), storrent::peer::peer_session::PeerSessionError> {
    let peer = BtPeer::new("127.0.0.1".to_string(), port);
    fixture.store.peer_connecting();
    let mut session = PeerSession::new(
        peer,
        fixture.torrent.clone(),
        fixture.store.clone(),
        fixture.queue.clone(),
        fixture.config.clone(),
        [1; 20],
    );
    session.start_outgoing()
}

fn exchange_handshake(stream: &mut TcpStream, torrent: &Torrent) {
    let mut hello = [0u8; HANDSHAKE_LENGTH];
    stream.read_exact(&mut hello).unwrap();
    let hello = Handshake::from_bytes(&hello).unwrap();
    assert_eq!(hello.info_hash, torrent.info_hash);

    stream
        .write_all(&Handshake::new(torrent.info_hash, [9; 20]).as_bytes())
        .unwrap();
}

fn send(stream: &mut TcpStream, message: &Message) {
    stream.write_all(&message.to_bytes()).unwrap();
}

fn try_read_message(stream: &mut TcpStream) -> Option<Message> {
    let mut prefix = [0u8; 4];
    if stream.read_exact(&mut prefix).is_err() {
        return None;
    }
    let length = u32::from_be_bytes(prefix) as usize;
    if length == 0 {
        return Some(Message::KeepAlive);
    }
    let mut body = vec![0u8; length];
    if stream.read_exact(&mut body).is_err() {
        return None;
    }
    Message::from_frame(&body).ok()
}

fn patterned(length: usize) -> Vec<u8> {
    (0..length).map(|at| (at % 251) as u8).collect()
}

fn cleanup(dir: PathBuf) {
    let _ = fs::remove_dir_all(dir);
}
