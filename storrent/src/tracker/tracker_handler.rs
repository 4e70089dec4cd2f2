use crate::torrent_handler::status::SwarmCounters;
use crate::torrent_parser::torrent::Torrent;

use super::http::http_handler::{HttpHandler, HttpHandlerError};
use super::http::query_params::{AnnounceEvent, QueryParams};
use super::http::url_parser::{ConnectionProtocol, TrackerUrl, TrackerUrlError};
use super::tracker_response::{FromTrackerResponseError, TrackerResponse};
use super::udp_handler::{UdpTrackerError, UdpTrackerHandler};

/// `TrackerHandler` struct for talking to the torrent's tracker over
/// whichever protocol its announce url names.
///
/// To get the tracker's peer list use the method `announce()`.
#[derive(Debug)]
pub struct TrackerHandler {
    pub torrent: Torrent,
    pub tracker_url: TrackerUrl,
    pub client_port: u16,
    client_peer_id: [u8; 20],
}

/// Posible `TrackerHandler` errors.
#[derive(Debug)]
pub enum TrackerHandlerError {
    HttpHandlerError(HttpHandlerError),
    UdpTrackerError(UdpTrackerError),
    FromTrackerResponseError(FromTrackerResponseError),
    UrlParseError(TrackerUrlError),
}

impl TrackerHandler {
    /// Builds a new `TrackerHandler` for a torrent, parsing its announce
    /// url.
    pub fn new(
        torrent: Torrent,
        client_port: u16,
        client_peer_id: [u8; 20],
    ) -> Result<Self, TrackerHandlerError> {
        let tracker_url = TrackerUrl::parse(torrent.announce_url.as_str())
            .map_err(TrackerHandlerError::UrlParseError)?;

        Ok(Self {
            torrent,
            tracker_url,
            client_port,
            client_peer_id,
        })
    }

    /// Announces the given event and counter snapshot, returning the
    /// tracker's interval, seeder/leecher totals and peer list.
    pub fn announce(
        &self,
        event: AnnounceEvent,
        counters: &SwarmCounters,
    ) -> Result<TrackerResponse, TrackerHandlerError> {
        let query_params = QueryParams {
            info_hash: self.torrent.info_hash,
            peer_id: self.client_peer_id,
            port: self.client_port,
            uploaded: counters.uploaded,
            downloaded: counters.downloaded,
            left: counters.left,
            event,
        };

        match self.tracker_url.protocol {
            ConnectionProtocol::Udp => UdpTrackerHandler::new(self.tracker_url.clone())
                .announce(&query_params)
                .map_err(TrackerHandlerError::UdpTrackerError),
            ConnectionProtocol::Http | ConnectionProtocol::Https => {
                let http_handler = HttpHandler::new(self.tracker_url.clone(), query_params);
                let body = if self.tracker_url.protocol == ConnectionProtocol::Https {
                    http_handler.https_request()
                } else {
                    http_handler.http_request()
                }
                .map_err(TrackerHandlerError::HttpHandlerError)?;

                TrackerResponse::from(body).map_err(TrackerHandlerError::FromTrackerResponseError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::Info;

    #[test]
    fn test_new_parses_the_announce_url() {
        let torrent = build_test_torrent("https://tracker.example:443/announce");

        let handler = TrackerHandler::new(torrent, 6881, [1; 20]).unwrap();

        assert_eq!(handler.tracker_url.protocol, ConnectionProtocol::Https);
        assert_eq!(handler.tracker_url.host, "tracker.example");
        assert_eq!(handler.tracker_url.port, 443);
    }

    #[test]
    fn test_new_accepts_udp_announce_urls() {
        let torrent = build_test_torrent("udp://tracker.example:2710/announce");

        let handler = TrackerHandler::new(torrent, 6881, [1; 20]).unwrap();

        assert_eq!(handler.tracker_url.protocol, ConnectionProtocol::Udp);
        assert_eq!(handler.tracker_url.port, 2710);
    }

    #[test]
    fn test_new_rejects_unknown_schemes() {
        let torrent = build_test_torrent("wss://tracker.example/announce");

        assert!(matches!(
            TrackerHandler::new(torrent, 6881, [1; 20]),
            Err(TrackerHandlerError::UrlParseError(_))
        ));
    }

    fn build_test_torrent(announce: &str) -> Torrent {
        Torrent {
            announce_url: announce.to_string(),
            info: Info {
                length: 100,
                name: "test".to_string(),
                piece_length: 100,
                pieces: vec![0; 20],
                private: None,
            },
            info_hash: [7; 20],
        }
    }
}
