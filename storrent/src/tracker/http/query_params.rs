use url_encoder::url_encoder::encode;

/// Announce events. A periodic announce carries no event at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    /// The `event` query value, when one applies.
    pub fn as_query(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }

    /// Event code used in UDP announce packets (BEP 15).
    pub fn udp_code(&self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// The full parameter set of one announce: identity, listening port and
/// the live swarm counters.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

impl QueryParams {
    /// Builds the query string, percent-encoding the binary parameters.
    pub fn build(&self) -> String {
        let mut query = format!(
            "?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            encode(&self.info_hash),
            encode(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left
        );
        if let Some(event) = self.event.as_query() {
            query.push_str("&event=");
            query.push_str(event);
        }
        query
    }
}
