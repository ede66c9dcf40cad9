use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "remora", version, about = "A BitTorrent client")]
pub struct Args {
    /// Path to a .torrent file, or a magnet link wrapped in quotes.
    pub source: String,

    /// Override the download directory.
    #[clap(short, long)]
    pub download_dir: Option<String>,

    /// Override the resume directory.
    #[clap(long)]
    pub resume_dir: Option<String>,
}
