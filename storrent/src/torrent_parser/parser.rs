use std::{
    fs::File,
    io::{BufReader, Error, Read},
    path::Path,
};

use super::torrent::{FromTorrentError, Torrent};
use bencoder::bencode::{Bencode, BencodeError};

#[derive(Debug)]
pub enum ParseError {
    IoError(Error),
    BencodeError(BencodeError),
    FromTorrentError(FromTorrentError),
}

pub struct TorrentParser;

impl TorrentParser {
    /// Given a path to a torrent file, it parses the file and returns a
    /// `Torrent` struct.
    ///
    /// # Errors
    ///
    /// * `ParseError::IoError` - An error occurred while reading the file
    /// * `ParseError::BencodeError` - An error occurred while parsing the bencode
    /// * `ParseError::FromTorrentError` - An error occurred while creating the Torrent struct
    pub fn parse(filepath: &Path) -> Result<Torrent, ParseError> {
        let buffer = TorrentParser::read_file(filepath).map_err(ParseError::IoError)?;

        let bencode = Bencode::decode(&buffer).map_err(ParseError::BencodeError)?;

        Torrent::from(bencode).map_err(ParseError::FromTorrentError)
    }

    fn read_file(filepath: &Path) -> Result<Vec<u8>, Error> {
        let file = File::open(filepath)?;
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();

        reader.read_to_end(&mut buffer)?;

        Ok(buffer)
    }
}
