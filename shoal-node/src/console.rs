//! Interactive console: `list`, `download <index> <file>`, `exit`.

use std::fmt::Write as _;

use shoal_core::PeerRecord;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::node::Node;

pub const HELP: &str = r#"Commands:
    "list": Prints peer indices and their files.
    "download <index> <fileName>": Downloads a file from the specified peer.
    "exit": Exits program."#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Download { index: u64, file: String },
    Exit,
}

/// Parse one console line. Command words are case-insensitive; file names are not.
pub fn parse(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(word) = parts.first() else {
        return Err("Error: Unknown command.".to_string());
    };
    match word.to_ascii_lowercase().as_str() {
        "list" => Ok(Command::List),
        "exit" => Ok(Command::Exit),
        "download" => {
            if parts.len() != 3 {
                return Err(
                    "Error: Invalid format, please use: download <index> <fileName>".to_string(),
                );
            }
            let index = parts[1]
                .parse::<u64>()
                .map_err(|_| format!("Error: Unknown peer: {}.", parts[1]))?;
            Ok(Command::Download {
                index,
                file: parts[2].to_string(),
            })
        }
        _ => Err("Error: Unknown command.".to_string()),
    }
}

/// Render the `list` output.
pub fn render_peers(peers: &[PeerRecord]) -> String {
    if peers.is_empty() {
        return "No peers found".to_string();
    }
    let mut out = String::new();
    for peer in peers {
        let files: Vec<&str> = peer.files.iter().map(|f| f.as_str()).collect();
        let _ = writeln!(out, "{}: {:?}", peer.display_index, files);
    }
    out.pop();
    out
}

/// Run commands from `input` until `exit` or end of input.
pub async fn run<R: AsyncBufRead + Unpin>(node: &Node, input: R) -> std::io::Result<()> {
    println!("{}", HELP);
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse(&line) {
            Ok(Command::List) => println!("{}", render_peers(&node.peers().await)),
            Ok(Command::Download { index, file }) => match node.download(index, &file).await {
                Ok(d) => println!("Downloaded: {} ({} bytes)", file, d.bytes),
                Err(e) => println!("Error: {}", e),
            },
            Ok(Command::Exit) => break,
            Err(msg) => println!("{}", msg),
        }
    }
    Ok(())
}
