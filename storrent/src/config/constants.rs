pub const TCP_PORT: &str = "TCP_PORT";
pub const DOWNLOAD_DIRECTORY: &str = "DOWNLOAD_DIRECTORY";
pub const PIPELINING_SIZE: &str = "PIPELINING_SIZE";
pub const MAX_PEERS_PER_TORRENT: &str = "MAX_PEERS_PER_TORRENT";
pub const SEED_ON_COMPLETE: &str = "SEED_ON_COMPLETE";
pub const UNCHOKE_SLOTS: &str = "UNCHOKE_SLOTS";
pub const UNCHOKE_ALL_INTERESTED: &str = "UNCHOKE_ALL_INTERESTED";

/// Settings that must appear in the config file. The peer cap, the
/// unchoke tuning keys and the seeding flag fall back to defaults when
/// absent.
pub const MIN_SETTINGS: usize = 3;

/// Listening port must live in the registered-port range.
pub const MIN_TCP_PORT: u16 = 1024;
pub const MAX_TCP_PORT: u16 = 49151;

pub const DEFAULT_UNCHOKE_SLOTS: usize = 3;
pub const DEFAULT_MAX_PEERS_PER_TORRENT: u32 = 50;
