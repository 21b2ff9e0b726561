use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

mod cli;
mod config;
mod embed;
mod media;
mod rank;
mod search;
mod select;
mod store;
mod verify;

use config::Config;
use search::{CancelToken, SearchOptions, SearchPipeline};
use verify::StrictMode;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let config = Config::load();

    match args.command {
        cli::Command::Search {
            query,
            dir,
            top_k,
            strictness,
            alpha,
            no_verify,
            drop_unverified,
            json,
        } => {
            let dir = resolve_dir(dir)?;
            let paths = media::collect_images(&dir)
                .with_context(|| format!("cannot read {}", dir.display()))?;
            if paths.is_empty() {
                println!("no images under {}", dir.display());
                return Ok(());
            }

            let mut opts = SearchOptions::from_config(&config.search);
            if let Some(k) = top_k {
                anyhow::ensure!(k > 0, "top-k must be positive");
                opts.top_k = k;
            }
            if let Some(s) = &strictness {
                opts.strictness = StrictMode::parse(s)
                    .with_context(|| format!("unknown strictness '{s}', expected loose, normal or strict"))?;
            }
            if let Some(a) = alpha {
                anyhow::ensure!((0.0..=1.0).contains(&a), "alpha must be within 0..=1");
                opts.alpha = a;
            }
            opts.verify = !no_verify;
            if drop_unverified {
                opts.keep_unverified = false;
            }

            let mut pipeline = SearchPipeline::from_config(&config);

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                log::info!("cancellation requested");
                handler_token.cancel();
            })
            .expect("Failed to set Ctrl+C handler");

            let bar = progress_bar();
            let bar_handle = bar.clone();
            let progress = move |pct: u8, msg: &str| {
                bar_handle.set_position(pct as u64);
                bar_handle.set_message(msg.to_string());
            };

            let outcome = pipeline.search(&paths, &query, &opts, Some(&progress), &cancel)?;
            bar.finish_and_clear();

            if outcome.cancelled {
                eprintln!("search cancelled, showing partial results");
            }
            if outcome.degraded {
                eprintln!("no embedding backend available, results are verification-only");
            }
            if !outcome.verification_available && !no_verify {
                eprintln!("verification unavailable, results are ranked by embeddings only");
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.results)?);
            } else if outcome.results.is_empty() {
                println!("no matches");
            } else {
                println!("{:>7}  {:>5}  path", "score", "conf");
                for result in &outcome.results {
                    let conf = result
                        .confidence
                        .map(|c| format!("{c:>5.2}"))
                        .unwrap_or_else(|| "    -".to_string());
                    println!("{:>7.3}  {}  {}", result.score, conf, result.path.display());
                }
            }
            Ok(())
        }

        cli::Command::Index { dir } => {
            let dir = resolve_dir(dir)?;
            let paths = media::collect_images(&dir)
                .with_context(|| format!("cannot read {}", dir.display()))?;
            if paths.is_empty() {
                println!("no images under {}", dir.display());
                return Ok(());
            }

            let mut pipeline = SearchPipeline::from_config(&config);
            anyhow::ensure!(
                pipeline.has_backend(),
                "no embedding backend available, nothing to index"
            );

            let bar = progress_bar();
            let bar_handle = bar.clone();
            let progress = move |pct: u8, msg: &str| {
                bar_handle.set_position(pct as u64);
                bar_handle.set_message(msg.to_string());
            };

            let updated = pipeline.index(&paths, Some(&progress));
            bar.finish_and_clear();

            println!("{} of {} embeddings computed or refreshed", updated, paths.len());
            Ok(())
        }

        cli::Command::Cache { action } => {
            let base = config.base_path();
            let embeddings_path = base.join("embeddings.bin");
            let verdicts_dir = base.join("verify-cache");

            match action {
                cli::CacheAction::Status {} => {
                    println!("data directory: {}", base.display());

                    match std::fs::metadata(&embeddings_path) {
                        Ok(meta) => println!("embeddings: {} bytes", meta.len()),
                        Err(_) => println!("embeddings: empty"),
                    }

                    let (count, bytes) = dir_stats(&verdicts_dir);
                    println!("verdicts: {count} entries, {bytes} bytes");
                    Ok(())
                }

                cli::CacheAction::Clear {
                    embeddings,
                    verdicts,
                } => {
                    // no flags clears everything
                    let all = !embeddings && !verdicts;

                    if embeddings || all {
                        match store::VectorStore::remove(&embeddings_path)
                            .context("cannot clear embedding store")?
                        {
                            true => println!("embedding store cleared"),
                            false => println!("embedding store already empty"),
                        }
                    }

                    if verdicts || all {
                        verify::cache::VerdictCache::new(verdicts_dir)
                            .clear()
                            .context("cannot clear verdict cache")?;
                        println!("verdict cache cleared");
                    }
                    Ok(())
                }
            }
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match dir {
        Some(d) => d,
        None => std::env::current_dir().context("cannot resolve current directory")?,
    };
    anyhow::ensure!(dir.is_dir(), "{} is not a directory", dir.display());
    Ok(dir)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("[{bar:30}] {percent:>3}% {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

fn dir_stats(dir: &std::path::Path) -> (usize, u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (0, 0);
    };
    let mut count = 0;
    let mut bytes = 0;
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                count += 1;
                bytes += meta.len();
            }
        }
    }
    (count, bytes)
}
