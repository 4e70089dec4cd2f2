use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait WriteAtOffset {
    fn write_all_at_offset(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
}

impl WriteAtOffset for File {
    fn write_all_at_offset(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}

pub trait ReadAtOffset {
    fn read_exact_at_offset(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;
}

impl ReadAtOffset for File {
    fn read_exact_at_offset(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Creates the download directory if needed and opens the output file
/// named after the torrent, truncating any previous content. The returned
/// handle is the one the piece store owns for the life of the process.
pub fn create_output_file(directory: &str, name: &str) -> io::Result<File> {
    if !Path::new(directory).exists() {
        fs::create_dir_all(directory)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(format!("{}/{}", directory, name))
}
