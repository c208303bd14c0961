use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract, embed, tag and index a single document.
    /// Prints the updated document as JSON.
    Process {
        /// Document id
        #[clap(short, long, required_unless_present = "input")]
        id: Option<u64>,

        /// A url to fetch (repeatable)
        #[clap(short, long)]
        url: Vec<String>,

        /// A local file (repeatable)
        #[clap(short, long)]
        file: Vec<PathBuf>,

        /// Existing tags, comma separated
        #[clap(short = 'g', long)]
        tags: Option<String>,

        /// Read the document from a JSON file instead
        #[clap(long, conflicts_with_all = ["id", "url", "file", "tags"])]
        input: Option<PathBuf>,
    },

    /// Semantic search over indexed documents
    Query {
        /// Free text query
        text: String,

        /// Max number of results
        #[clap(short, long, default_value = "10")]
        k: usize,

        /// Print distances next to ids
        #[clap(long, default_value = "false")]
        distances: bool,
    },

    /// Drop the index and rebuild it from a list of documents
    Rebuild {
        /// JSON array of documents
        #[clap(short, long)]
        input: PathBuf,

        /// Write the updated documents here instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Print index status
    Status {},
}
