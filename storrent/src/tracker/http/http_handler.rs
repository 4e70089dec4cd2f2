use native_tls::Error;
use native_tls::HandshakeError;
use native_tls::TlsConnector;
use std::io::Error as IOError;
use std::io::{Read, Write};
use std::net::TcpStream;

use super::query_params::QueryParams;
use super::url_parser::TrackerUrl;

/// `HttpHandler` struct to make **HTTP** requests.
///
/// To make a **HTTPS** request use the method `https_request()`.
///
/// To make a **HTTP** request use the method `http_request()`.
#[derive(Debug)]
pub struct HttpHandler {
    tracker_url: TrackerUrl,
    query_params: QueryParams,
}

/// Posible `HttpHandler` errors
#[derive(Debug)]
pub enum HttpHandlerError {
    CreateTlsConnectorError(Error),
    TcpStreamConnectError(IOError),
    TlsStreamConnectError(TlsStreamConnectError),
    ErrorWritingStream(IOError),
    ErrorReadingStream(IOError),
}

/// Posible `TlsStreamConnect` errors.
///
/// `FatalError` is an error that should not continue the program.
///
/// `BlockError` is an error that can be caused because the stream is
/// performing I/O; it should be safe to call `handshake` at a later time.
#[derive(Debug)]
pub enum TlsStreamConnectError {
    FatalError,
    BlockError,
}

impl HttpHandler {
    pub fn new(tracker_url: TrackerUrl, query_params: QueryParams) -> Self {
        Self {
            tracker_url,
            query_params,
        }
    }

    /// Makes a **HTTPS** request to the tracker url.
    ///
    /// On success it returns a `Vec<u8>` containing the response body.
    ///
    /// It returns an `HttpHandlerError` if:
    /// - There was a problem creating a TlsConnector.
    /// - There was a problem connecting to the tracker url.
    /// - There was a problem writing to or reading from the stream.
    pub fn https_request(&self) -> Result<Vec<u8>, HttpHandlerError> {
        let connector = TlsConnector::new().map_err(HttpHandlerError::CreateTlsConnectorError)?;
        let stream = self.connect_tcp_stream()?;
        let mut stream = match connector.connect(self.tracker_url.host.as_str(), stream) {
            Ok(stream) => stream,
            Err(HandshakeError::Failure(_)) => {
                return Err(HttpHandlerError::TlsStreamConnectError(
                    TlsStreamConnectError::FatalError,
                ))
            }
            Err(HandshakeError::WouldBlock(_)) => {
                return Err(HttpHandlerError::TlsStreamConnectError(
                    TlsStreamConnectError::BlockError,
                ))
            }
        };
        self.request_and_decode(&mut stream)
    }

    /// Makes a plain **HTTP** request to the tracker url.
    pub fn http_request(&self) -> Result<Vec<u8>, HttpHandlerError> {
        self.request_and_decode(&self.connect_tcp_stream()?)
    }

    fn connect_tcp_stream(&self) -> Result<TcpStream, HttpHandlerError> {
        let connect_url = format!("{}:{}", self.tracker_url.host, self.tracker_url.port);
        TcpStream::connect(connect_url).map_err(HttpHandlerError::TcpStreamConnectError)
    }

    fn request_and_decode<A>(&self, mut stream: A) -> Result<Vec<u8>, HttpHandlerError>
    where
        A: Write + Read,
    {
        let query_params = self.query_params.build();
        let mut request = format!(
            "GET /{}{} HTTP/1.1",
            self.tracker_url.endpoint, query_params
        );
        request.push_str("\r\n");
        request.push_str("Host: ");
        request.push_str(self.tracker_url.host.as_str());
        request.push_str("\r\n");
        request.push_str("User-Agent: storrent/0.1");
        request.push_str("\r\n");
        request.push_str("Connection: close");
        request.push_str("\r\n");
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .map_err(HttpHandlerError::ErrorWritingStream)?;

        let mut response = vec![];
        stream
            .read_to_end(&mut response)
            .map_err(HttpHandlerError::ErrorReadingStream)?;

        Ok(Self::strip_http_headers(&response).to_vec())
    }

    /// The body starts after the first blank line.
    fn strip_http_headers(response: &[u8]) -> &[u8] {
        for (at, window) in response.windows(4).enumerate() {
            if window == b"\r\n\r\n" {
                return &response[at + 4..];
            }
        }
        response
    }
}
