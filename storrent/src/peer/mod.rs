pub mod bt_peer;
pub mod handshake;
pub mod message_receiver;
pub mod peer_message;
pub mod peer_session;
pub mod session_handle;
pub mod session_status;
