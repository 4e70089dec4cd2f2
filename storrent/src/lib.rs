pub mod bt_server;
pub mod config;
pub mod peer;
pub mod storage_manager;
pub mod torrent_handler;
pub mod torrent_parser;
pub mod tracker;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a block request in bytes. The final block of the final piece
/// may be shorter.
pub const BLOCK_SIZE: u32 = 16_384;

/// Generates a process-unique 20-byte peer id in the Azureus style:
/// a fixed client prefix followed by twelve random alphanumeric bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-ST0100-");
    for (slot, c) in id[8..].iter_mut().zip(rand::thread_rng().sample_iter(&Alphanumeric)) {
        *slot = c;
    }
    id
}
