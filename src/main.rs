use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod document;
mod extract;
mod lock;
mod pipeline;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;

use config::Config;
use document::{parse_tags, Document, SourceReference};
use pipeline::IndexingPipeline;

fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SMARTMARKS_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/smartmarks"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("{} is malformed", path.display()))
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config = Config::load_with(&base_path()?)?;
    let pipeline = IndexingPipeline::from_config(&config)?;

    match args.command {
        cli::Command::Process {
            id,
            url,
            file,
            tags,
            input,
        } => {
            let document = match (input, id) {
                (Some(input), _) => read_json::<Document>(&input)?,
                (None, Some(id)) => {
                    let sources = url
                        .into_iter()
                        .map(SourceReference::Url)
                        .chain(file.into_iter().map(SourceReference::File))
                        .collect();
                    let mut document = Document::new(id, sources);
                    document.tags.extend(tags.map(parse_tags).unwrap_or_default());
                    document
                }
                (None, None) => bail!("either --id or --input is required"),
            };

            let outcome = pipeline.process(document)?;
            for (stage, result) in &outcome.report.stages {
                if !result.is_completed() {
                    log::info!("{:?}: {:?}", stage, result);
                }
            }
            log::info!(
                "document {} reached {:?}",
                outcome.report.document_id,
                outcome.report.reached
            );
            if outcome.report.needs_rebuild {
                log::error!("the vector index is unusable, run `smartmarks rebuild`");
            }

            println!("{}", serde_json::to_string_pretty(&outcome.document)?);
            Ok(())
        }

        cli::Command::Query { text, k, distances } => {
            if distances {
                let hits = pipeline.query_with_distances(&text, k)?;
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                let ids = pipeline.query(&text, k)?;
                println!("{}", serde_json::to_string(&ids)?);
            }
            Ok(())
        }

        cli::Command::Rebuild { input, output, yes } => {
            let documents: Vec<Document> = read_json(&input)?;

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "This replaces the whole index with {} documents. Continue?",
                    documents.len()
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            let progress = ProgressBar::new(documents.len() as u64);
            progress.set_style(
                ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")?,
            );

            let documents = pipeline.rebuild_with_progress(documents, &|document| {
                progress.set_message(format!("#{}", document.id));
                progress.inc(1);
            })?;
            progress.finish_and_clear();

            let json = serde_json::to_string_pretty(&documents)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{}", json),
            }

            let status = pipeline.status()?;
            log::info!("{} vectors indexed", status.ntotal);
            Ok(())
        }

        cli::Command::Status {} => {
            let status = pipeline.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}
