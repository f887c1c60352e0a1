use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use url::Url;

use sitesnap::cli::{Cli, Commands, RepoFormat};
use sitesnap::diff::{self, DiffOptions};
use sitesnap::files::{self, UrlMapping};
use sitesnap::scraper::{self, FollowUrl, Scraper, ScraperConfig};
use sitesnap::store::Store;
use sitesnap::{logging, urlkey};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Scrape {
            repo_path,
            urls,
            allow_root,
            user_agent,
            remap_address,
            strip_https,
            workers,
            rate_limit,
        } => {
            run_scrape(
                repo_path,
                urls,
                allow_root,
                user_agent,
                remap_address,
                strip_https,
                workers,
                rate_limit,
            )
            .await
        }
        Commands::List {
            repo_path,
            format,
            canonical,
        } => run_list(repo_path, format, canonical),
        Commands::Show {
            repo_path,
            url,
            format,
        } => run_show(repo_path, &url, format),
        Commands::Diff {
            repo_path_a,
            repo_path_b,
            a_format,
            b_format,
            ignore_status,
            headers,
        } => run_diff(
            repo_path_a,
            repo_path_b,
            a_format,
            b_format,
            ignore_status,
            headers,
        ),
        Commands::Files {
            repo_path,
            out_dir,
            rewrite_url,
        } => run_files(repo_path, out_dir, &rewrite_url),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scrape(
    repo_path: PathBuf,
    urls: Vec<String>,
    allow_root: Vec<String>,
    user_agent: Option<String>,
    remap_address: Vec<String>,
    strip_https: bool,
    workers: usize,
    rate_limit: u32,
) -> anyhow::Result<()> {
    let initial = urls
        .iter()
        .map(|arg| Url::parse(arg).with_context(|| format!("parse initial url {arg:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let root_keys = allow_root
        .iter()
        .map(|arg| {
            Url::parse(arg)
                .map(|u| urlkey::key(&u))
                .with_context(|| format!("parse root url {arg:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut remap_addresses = HashMap::new();
    for mapping in &remap_address {
        let (orig, target) = scraper::parse_remap_mapping(mapping).map_err(anyhow::Error::msg)?;
        remap_addresses.insert(orig, target);
    }

    fs::create_dir_all(&repo_path)
        .with_context(|| format!("create repository {}", repo_path.display()))?;
    let store = Arc::new(Store::new(repo_path));

    let follow: Arc<FollowUrl> = Arc::new(move |u: &Url| {
        let key = urlkey::key(u);
        root_keys.iter().any(|root| key.starts_with(root.as_str()))
    });

    let config = ScraperConfig {
        workers,
        requests_per_second: rate_limit,
        user_agent,
        strip_https,
        remap_addresses,
        ..ScraperConfig::default()
    };
    let scraper = Arc::new(Scraper::new(store, follow, config)?);
    scraper.run(initial).await;
    Ok(())
}

fn run_list(repo_path: PathBuf, format: RepoFormat, canonical: bool) -> anyhow::Result<()> {
    ensure_native(format)?;
    let store = Store::new(repo_path);
    let mut stdout = io::stdout().lock();
    for entry in store.list()? {
        let doc = entry.open()?;
        if canonical {
            let url = Url::parse(&doc.metadata.url)
                .with_context(|| format!("stored url {:?}", doc.metadata.url))?;
            writeln!(stdout, "{}", urlkey::canonical(&url))?;
        } else {
            writeln!(stdout, "{}", doc.metadata.url)?;
        }
    }
    Ok(())
}

fn run_show(repo_path: PathBuf, url: &str, format: RepoFormat) -> anyhow::Result<()> {
    ensure_native(format)?;
    let parsed = Url::parse(url).with_context(|| format!("parse url {url:?}"))?;
    let store = Store::new(repo_path);
    let mut doc = store.load(&urlkey::key(&parsed))?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "URL: {}", doc.metadata.url)?;
    writeln!(stdout, "Key: {}", doc.metadata.key)?;
    writeln!(
        stdout,
        "Download started: {}",
        doc.metadata.download_started_time.to_rfc3339()
    )?;
    writeln!(stdout)?;

    write!(stdout, "{} {}\r\n", doc.metadata.proto, doc.metadata.status)?;
    for (name, values) in &doc.metadata.headers {
        for value in values {
            write!(stdout, "{name}: {value}\r\n")?;
        }
    }
    write!(stdout, "\r\n")?;
    io::copy(&mut doc.body()?, &mut stdout)?;
    Ok(())
}

fn run_diff(
    repo_path_a: PathBuf,
    repo_path_b: PathBuf,
    a_format: RepoFormat,
    b_format: RepoFormat,
    ignore_status: Vec<u16>,
    headers: bool,
) -> anyhow::Result<()> {
    ensure_native(a_format)?;
    ensure_native(b_format)?;
    let options = DiffOptions {
        ignore_statuses: ignore_status,
        headers,
    };
    diff::diff_repositories(
        &Store::new(repo_path_a),
        &Store::new(repo_path_b),
        &options,
        &mut io::stdout().lock(),
    )?;
    Ok(())
}

fn run_files(repo_path: PathBuf, out_dir: PathBuf, rewrite_url: &[String]) -> anyhow::Result<()> {
    let mut mappings = Vec::new();
    for arg in rewrite_url {
        let (old_base, new_base) = arg
            .split_once('|')
            .context("rewrite-url requires two pipe separated URLs")?;
        mappings.push(UrlMapping {
            old_base: Url::parse(old_base)
                .with_context(|| format!("parse rewrite-url base {old_base:?}"))?,
            new_base: Url::parse(new_base)
                .with_context(|| format!("parse rewrite-url base {new_base:?}"))?,
        });
    }
    files::generate(&Store::new(repo_path), &out_dir, &mappings)?;
    Ok(())
}

fn ensure_native(format: RepoFormat) -> anyhow::Result<()> {
    if format == RepoFormat::Foreign {
        bail!("the foreign repository format is not supported by this build");
    }
    Ok(())
}
