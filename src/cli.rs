//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "sitesnap")]
#[command(about = "Scrape a website and convert it to a static site")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scrape URLs into a repository
    Scrape {
        /// Repository directory
        repo_path: PathBuf,

        /// URLs to start from
        #[arg(required = true)]
        urls: Vec<String>,

        /// URL prefixes to allow; discovered URLs outside them are not
        /// followed
        #[arg(long)]
        allow_root: Vec<String>,

        /// User-Agent string to use
        #[arg(long)]
        user_agent: Option<String>,

        /// Instead of connecting to orig_addr, connect to new_addr
        #[arg(long, value_name = "ORIG_ADDR|NEW_ADDR")]
        remap_address: Vec<String>,

        /// Use plain HTTP (without TLS) for https URLs
        #[arg(long)]
        strip_https: bool,

        /// Worker count
        #[arg(long, default_value_t = 10)]
        workers: usize,

        /// Rate limit in requests per second
        #[arg(long, default_value_t = 10)]
        rate_limit: u32,
    },

    /// List URLs stored in a repository
    List {
        /// Repository directory
        repo_path: PathBuf,

        /// Repository format
        #[arg(long, value_enum, default_value_t = RepoFormat::Native)]
        format: RepoFormat,

        /// Print canonical URLs
        #[arg(long)]
        canonical: bool,
    },

    /// Show one URL stored in a repository
    Show {
        /// Repository directory
        repo_path: PathBuf,

        /// Absolute URL to show
        url: String,

        /// Repository format
        #[arg(long, value_enum, default_value_t = RepoFormat::Native)]
        format: RepoFormat,
    },

    /// Diff two repositories
    Diff {
        /// First repository directory
        repo_path_a: PathBuf,

        /// Second repository directory
        repo_path_b: PathBuf,

        /// Format of the first repository
        #[arg(long, value_enum, default_value_t = RepoFormat::Native)]
        a_format: RepoFormat,

        /// Format of the second repository
        #[arg(long, value_enum, default_value_t = RepoFormat::Native)]
        b_format: RepoFormat,

        /// Don't show diffs when both sides have one of these status codes
        #[arg(long, value_delimiter = ',')]
        ignore_status: Vec<u16>,

        /// Show diff of headers
        #[arg(long)]
        headers: bool,
    },

    /// Copy stored files into a directory
    Files {
        /// Repository directory
        repo_path: PathBuf,

        /// Output directory; must not exist yet
        out_dir: PathBuf,

        /// Rewrite links under OLD_URL to NEW_URL
        #[arg(long, value_name = "OLD_URL|NEW_URL")]
        rewrite_url: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RepoFormat {
    /// This tool's repository layout
    Native,
    /// A foreign archiver's cache (not supported by this build)
    Foreign,
}
