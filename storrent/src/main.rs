use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use storrent::config::cfg::Cfg;
use storrent::generate_peer_id;
use storrent::torrent_handler::handler::TorrentHandler;
use storrent::torrent_parser::parser::TorrentParser;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the .torrent file
    #[arg(short, long)]
    file: String,
    /// Path to the config file
    #[arg(short, long)]
    config: String,
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();
    let file_path = PathBuf::from(args.file.trim());

    let torrent = TorrentParser::parse(&file_path).expect("could not parse the torrent file");
    let config = Cfg::new(args.config.trim()).expect("Config file not found or incomplete");
    let client_peer_id = generate_peer_id();

    let mut handler = TorrentHandler::new(torrent, config, client_peer_id)
        .expect("could not set up the download");

    if let Err(err) = handler.handle() {
        error!("Torrent failed: {:?}", err);
        std::process::exit(1);
    }
}
