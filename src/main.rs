use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;
mod eid;
mod engine;
mod faces;
mod fusion;
mod intent;
mod keyword;
mod people;
mod persons;
mod photos;
mod pipeline;
mod semantic;
mod similarity;
mod storage;
#[cfg(test)]
mod tests;

use cli::{FacesArgs, IndexArgs, PersonArgs, QueueArgs};
use config::Config;
use engine::{SearchEngine, SearchOptions};
use faces::AutoMatchOptions;
use fusion::FusionMode;
use inquire::error::InquireResult;
use people::PersonPhotosOptions;
use persons::PersonCreate;
use photos::PhotoCreate;
use pipeline::Priority;

pub fn parse_tags(tags: String) -> Vec<String> {
    tags.split(',')
        .map(|value| value.split(&[' ', ' ']).filter(|value| !value.is_empty()))
        .flatten()
        .map(|s| s.to_lowercase().to_string())
        .collect::<Vec<_>>()
}

/// Capture time fallback when none was given: the file's mtime.
fn file_taken_at(path: &str) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::from(modified))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = Config::load();
    let base_path = config.base_path().to_string();
    tracing::debug!("Using data directory {base_path}");

    let photos = Arc::new(photos::BackendCsv::load(
        &format!("{base_path}/photos.csv"),
        PathBuf::from(&base_path).join("vectors.bin"),
    )?);
    let persons = Arc::new(persons::BackendCsv::load(
        &format!("{base_path}/persons.csv"),
        &format!("{base_path}/faces.csv"),
    )?);
    let engine = SearchEngine::new(config, photos, persons)?;

    match args.command {
        cli::Command::Add {
            paths,
            title,
            description,
            tags,
            taken_at,
        } => {
            let taken_at = match taken_at {
                Some(raw) => Some(
                    DateTime::parse_from_rfc3339(&raw)
                        .map_err(|err| anyhow::anyhow!("invalid --taken-at {raw:?}: {err}"))?
                        .with_timezone(&Utc),
                ),
                None => None,
            };

            let mut added = Vec::new();
            for path in paths {
                let photo = engine.add_photo(PhotoCreate {
                    path: path.clone(),
                    title: title.clone(),
                    description: description.clone(),
                    tags: tags.clone().map(parse_tags),
                    taken_at: taken_at.or_else(|| file_taken_at(&path)),
                })?;
                engine.enqueue_vector_generation(photo.id, Some(path), Priority::High)?;
                added.push(photo);
            }

            eprintln!(
                "{} photos queued for embedding; run `pix queue run` to process them",
                added.len()
            );
            println!("{}", serde_json::to_string_pretty(&added).unwrap());
            Ok(())
        }

        cli::Command::List { limit } => {
            let mut photos = engine.photos().all()?;
            if let Some(limit) = limit {
                photos.truncate(limit);
            }
            println!("{}", serde_json::to_string_pretty(&photos).unwrap());
            Ok(())
        }

        cli::Command::Rm { id, yes } => {
            let Some(photo) = engine.photos().get(id)? else {
                bail!("Photo with id {id} not found");
            };

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Are you sure you want to delete {}?",
                    photo.file_name
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            engine.remove_photo(id)?;
            println!("1 item removed");
            Ok(())
        }

        cli::Command::Search {
            query,
            limit,
            rrf,
            min_score,
        } => {
            let options = SearchOptions {
                limit,
                min_score,
                mode: rrf.then_some(FusionMode::Rrf),
                dedup: None,
            };
            let response = engine.search(&query, &options)?;
            println!("{}", serde_json::to_string_pretty(&response).unwrap());
            Ok(())
        }

        cli::Command::Similar { id, top } => {
            let hits = engine.find_similar(id, top)?;
            println!("{}", serde_json::to_string_pretty(&hits).unwrap());
            Ok(())
        }

        cli::Command::Intent { query } => {
            let intent = engine.parse_query(&query);
            println!("{}", serde_json::to_string_pretty(&intent).unwrap());
            Ok(())
        }

        cli::Command::Person { action } => match action {
            PersonArgs::Add {
                name,
                display_name,
                aliases,
            } => {
                // Aliases split on commas only; names may contain spaces
                let aliases = aliases.map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                });
                let person = engine.persons().create_person(PersonCreate {
                    name,
                    display_name,
                    aliases,
                })?;
                println!("{}", serde_json::to_string_pretty(&person).unwrap());
                Ok(())
            }

            PersonArgs::List {} => {
                let persons = engine.persons().all_persons()?;
                println!("{}", serde_json::to_string_pretty(&persons).unwrap());
                Ok(())
            }

            PersonArgs::Search { query } => {
                let matches = engine.people().search(&query)?;
                println!("{}", serde_json::to_string_pretty(&matches).unwrap());
                Ok(())
            }

            PersonArgs::Photos {
                id,
                year,
                month,
                limit,
            } => {
                let photos = engine.people().get_photos(
                    id,
                    &PersonPhotosOptions {
                        year,
                        month,
                        limit,
                        offset: 0,
                    },
                )?;
                println!("{}", serde_json::to_string_pretty(&photos).unwrap());
                Ok(())
            }

            PersonArgs::Suggest { prefix, limit } => {
                let matches = engine.people().get_suggestions(&prefix, limit)?;
                println!("{}", serde_json::to_string_pretty(&matches).unwrap());
                Ok(())
            }

            PersonArgs::Popular { limit } => {
                let popular = engine.people().get_popular(limit)?;
                println!("{}", serde_json::to_string_pretty(&popular).unwrap());
                Ok(())
            }
        },

        cli::Command::Faces { action } => match action {
            FacesArgs::Cluster {} => {
                let clusters = engine.cluster_faces()?;
                println!("{}", serde_json::to_string_pretty(&clusters).unwrap());
                Ok(())
            }

            FacesArgs::Automatch {} => {
                let outcome = engine.auto_match_faces(AutoMatchOptions::default())?;
                println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
                Ok(())
            }

            FacesArgs::Assign { face_id, person_id } => {
                let face = engine.assign_face_to_person(face_id, person_id)?;
                println!("{}", serde_json::to_string_pretty(&face).unwrap());
                Ok(())
            }

            FacesArgs::Unmatch { face_id } => {
                let face = engine.unmatch_face(face_id)?;
                println!("{}", serde_json::to_string_pretty(&face).unwrap());
                Ok(())
            }
        },

        cli::Command::Queue { action } => match action {
            QueueArgs::Run {} => {
                engine.recover_queue()?;

                let pipeline = engine.pipeline();
                {
                    let pipeline = pipeline.clone();
                    ctrlc::set_handler(move || pipeline.cancel())?;
                }

                let before = pipeline.stats();
                if before.pending == 0 {
                    println!("Nothing to embed");
                    return Ok(());
                }

                // History persists across runs; the bar tracks only this
                // run's share of the counters.
                let done_base = before.completed + before.failed as u64;
                let bar = ProgressBar::new(before.pending as u64);
                bar.set_style(
                    ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                        .progress_chars("=> "),
                );

                let runner = pipeline.clone();
                let worker = thread::spawn(move || runner.process());
                while !worker.is_finished() {
                    let now = pipeline.stats();
                    bar.set_position((now.completed + now.failed as u64).saturating_sub(done_base));
                    thread::sleep(Duration::from_millis(100));
                }
                let stats = match worker.join() {
                    Ok(stats) => stats,
                    Err(_) => bail!("embedding workers panicked"),
                };

                bar.set_position((stats.completed + stats.failed as u64).saturating_sub(done_base));
                if pipeline.is_cancelled() {
                    bar.abandon_with_message("cancelled");
                } else {
                    bar.finish_and_clear();
                }
                println!("{}", serde_json::to_string_pretty(&stats).unwrap());
                Ok(())
            }

            QueueArgs::Stats {} => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&engine.queue_stats()).unwrap()
                );
                Ok(())
            }

            QueueArgs::Recover {} => {
                let queued = engine.recover_queue()?;
                println!("{queued} photos queued for embedding");
                Ok(())
            }

            QueueArgs::RetryFailed {} => {
                let count = engine.pipeline().retry_failed();
                println!("{count} failed tasks requeued");
                Ok(())
            }
        },

        cli::Command::Index { action } => match action {
            IndexArgs::Rebuild {} => {
                let stats = engine.rebuild_index()?;
                println!("{}", serde_json::to_string_pretty(&stats).unwrap());
                Ok(())
            }

            IndexArgs::Stats {} => {
                let stats = engine.index_stats()?;
                println!("{}", serde_json::to_string_pretty(&stats).unwrap());
                Ok(())
            }
        },
    }
}
