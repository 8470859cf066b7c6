//! # Marmot
//!
//! A command-line BitTorrent leecher for single-file torrents.
//!
//! Given a metainfo file, marmot announces to the torrent's tracker(s),
//! connects to every peer in the swarm, and downloads all pieces in
//! parallel, one worker thread per peer. Every piece is verified against
//! its SHA-1 digest before it is written at its offset in the output file.
//!
//! ## Usage
//!
//! ```bash
//! marmot <torrent_file>
//! marmot <torrent_file> -o <output_file>
//! ```
//!
//! The download goes to `<output>.download` first and is renamed into place
//! only when every piece has been verified. Setting the `DEBUG` environment
//! variable to a non-empty value enables per-message logging; `RUST_LOG`
//! overrides the filter entirely.

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod handshake;
mod message;
mod peer;
mod piece;
mod torrent;
mod tracker;
mod worker;

use std::env;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent leecher, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to the name from the torrent)
    #[arg(short = 'o', long)]
    output: Option<String>,
}

/// Keep torrent-supplied names from escaping the working directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    let torrent = Torrent::open(&args.torrent)?;

    let output_name = match args.output {
        Some(name) => name,
        None => sanitize_filename(torrent.name()),
    };

    // Download into a scratch file; the real name appears only once every
    // piece has been verified and written.
    let scratch_name = format!("{output_name}.download");
    let mut scratch = File::create(&scratch_name)
        .with_context(|| format!("could not create output file {scratch_name:?}"))?;

    torrent.download(&mut scratch)?;
    drop(scratch);

    fs::rename(&scratch_name, &output_name)
        .with_context(|| format!("could not move download to {output_name:?}"))?;

    println!("Saved in {output_name:?}.");
    Ok(())
}

fn init_logger() {
    let debug = env::var_os("DEBUG").is_some_and(|value| !value.is_empty());

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn main() {
    init_logger();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {error:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_flattens_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("plain.iso"), "plain.iso");
    }

    #[test]
    fn sanitize_filename_rejects_empty_names() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
