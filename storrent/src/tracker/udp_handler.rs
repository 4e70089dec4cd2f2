use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use rand::Rng;

use crate::peer::bt_peer::BtPeer;

use super::http::query_params::QueryParams;
use super::http::url_parser::TrackerUrl;
use super::tracker_response::TrackerResponse;

/// Magic constant opening every UDP tracker conversation (BEP 15).
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const UDP_TIMEOUT: Duration = Duration::from_secs(3);
/// Let the tracker choose how many peers to hand out.
const NUM_WANT_DEFAULT: i32 = -1;

/// Announce over UDP: one connect round-trip to obtain a connection id,
/// then one announce round-trip. Responses are matched on the transaction
/// id; a mismatch means the datagram was not for us.
#[derive(Debug)]
pub struct UdpTrackerHandler {
    tracker_url: TrackerUrl,
}

/// Posible `UdpTrackerHandler` errors.
#[derive(Debug)]
pub enum UdpTrackerError {
    SocketError(io::Error),
    ShortResponse,
    TransactionMismatch,
    UnexpectedAction(u32),
    TrackerError(String),
}

impl UdpTrackerHandler {
    pub fn new(tracker_url: TrackerUrl) -> Self {
        Self { tracker_url }
    }

    pub fn announce(&self, params: &QueryParams) -> Result<TrackerResponse, UdpTrackerError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(UdpTrackerError::SocketError)?;
        socket
            .set_read_timeout(Some(UDP_TIMEOUT))
            .map_err(UdpTrackerError::SocketError)?;
        socket
            .connect((self.tracker_url.host.as_str(), self.tracker_url.port))
            .map_err(UdpTrackerError::SocketError)?;

        let connect_transaction: u32 = rand::thread_rng().gen();
        socket
            .send(&build_connect_request(connect_transaction))
            .map_err(UdpTrackerError::SocketError)?;

        let mut buffer = [0u8; 1024];
        let received = socket
            .recv(&mut buffer)
            .map_err(UdpTrackerError::SocketError)?;
        let connection_id = parse_connect_response(&buffer[..received], connect_transaction)?;

        let announce_transaction: u32 = rand::thread_rng().gen();
        socket
            .send(&build_announce_request(
                connection_id,
                announce_transaction,
                params,
            ))
            .map_err(UdpTrackerError::SocketError)?;

        let mut buffer = [0u8; 4096];
        let received = socket
            .recv(&mut buffer)
            .map_err(UdpTrackerError::SocketError)?;
        parse_announce_response(&buffer[..received], announce_transaction)
    }
}

fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    packet
}

fn parse_connect_response(response: &[u8], transaction_id: u32) -> Result<u64, UdpTrackerError> {
    if response.len() < 16 {
        return Err(UdpTrackerError::ShortResponse);
    }
    check_header(response, ACTION_CONNECT, transaction_id)?;
    Ok(read_u64(&response[8..16]))
}

fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    params: &QueryParams,
) -> [u8; 98] {
    let mut packet = [0u8; 98];
    packet[0..8].copy_from_slice(&connection_id.to_be_bytes());
    packet[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    packet[16..36].copy_from_slice(&params.info_hash);
    packet[36..56].copy_from_slice(&params.peer_id);
    packet[56..64].copy_from_slice(&params.downloaded.to_be_bytes());
    packet[64..72].copy_from_slice(&params.left.to_be_bytes());
    packet[72..80].copy_from_slice(&params.uploaded.to_be_bytes());
    packet[80..84].copy_from_slice(&params.event.udp_code().to_be_bytes());
    // bytes 84..88: ip address, zero lets the tracker use the source
    packet[88..92].copy_from_slice(&rand::thread_rng().gen::<u32>().to_be_bytes());
    packet[92..96].copy_from_slice(&NUM_WANT_DEFAULT.to_be_bytes());
    packet[96..98].copy_from_slice(&params.port.to_be_bytes());
    packet
}

fn parse_announce_response(
    response: &[u8],
    transaction_id: u32,
) -> Result<TrackerResponse, UdpTrackerError> {
    if response.len() < 8 {
        return Err(UdpTrackerError::ShortResponse);
    }
    check_header(response, ACTION_ANNOUNCE, transaction_id)?;
    if response.len() < 20 {
        return Err(UdpTrackerError::ShortResponse);
    }

    let interval = read_u32(&response[8..12]) as i64;
    let leechers = read_u32(&response[12..16]) as i64;
    let seeders = read_u32(&response[16..20]) as i64;

    let mut peers = Vec::new();
    for entry in response[20..].chunks(6) {
        if entry.len() < 6 {
            break;
        }
        if let Ok(peer) = BtPeer::from_compact(entry) {
            peers.push(peer);
        }
    }

    Ok(TrackerResponse {
        interval,
        complete: seeders,
        incomplete: leechers,
        peers,
    })
}

fn check_header(
    response: &[u8],
    expected_action: u32,
    transaction_id: u32,
) -> Result<(), UdpTrackerError> {
    let action = read_u32(&response[0..4]);
    if action == ACTION_ERROR {
        let reason = String::from_utf8_lossy(&response[8..]).to_string();
        return Err(UdpTrackerError::TrackerError(reason));
    }
    if action != expected_action {
        return Err(UdpTrackerError::UnexpectedAction(action));
    }
    if read_u32(&response[4..8]) != transaction_id {
        return Err(UdpTrackerError::TransactionMismatch);
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
