use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::curate::{CurateOptions, ImageSize};
use crate::download::{Downloader, DATASETS_SERVER_URL, DEFAULT_DATASET};
use crate::split::SplitRatios;
use crate::{augment, curate, prepare, split, stats, visualize, Result, Summary};

#[derive(Parser, Debug)]
#[command(author, version, about = "Prepare pottery image datasets for LoRA training")]
pub struct DatasetArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a labelled image dataset from the Hugging Face Hub
    Download {
        #[arg(long, default_value = DEFAULT_DATASET)]
        dataset: String,
        #[arg(long, default_value = "train")]
        split: String,
        #[arg(long, default_value = "data/pottery")]
        output: PathBuf,
        /// Stop after this many rows
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long = "server-url", env = "KILN_DATASETS_SERVER", default_value = DATASETS_SERVER_URL)]
        server_url: String,
    },
    /// Write randomly flipped, rotated and colour-jittered copies of every image
    Augment {
        #[arg(long, default_value = "data/pottery")]
        input: PathBuf,
        #[arg(long, default_value = "data/pottery_augmented")]
        output: PathBuf,
        #[arg(long = "num-augments", default_value_t = 3)]
        num_augments: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Split every label into train/val/test
    Split {
        #[arg(long, default_value = "data/pottery_augmented")]
        input: PathBuf,
        #[arg(long, default_value = "data/pottery_split")]
        output: PathBuf,
        #[arg(long, default_value_t = 0.7)]
        train: f64,
        #[arg(long, default_value_t = 0.15)]
        val: f64,
        #[arg(long, default_value_t = 0.15)]
        test: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Convert to RGB, resize and export labels.csv
    Curate {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Target size as WIDTHxHEIGHT
        #[arg(long, default_value = "512x512")]
        size: ImageSize,
        #[arg(long, default_value_t = 8)]
        workers: usize,
        /// Skip writing labels.csv
        #[arg(long = "no-labels")]
        no_labels: bool,
    },
    /// Print label distribution and image size statistics
    Stats {
        #[arg(long, default_value = "data/pottery_split/train")]
        input: PathBuf,
    },
    /// Flatten the label directories into one folder for diffusers training
    Prepare {
        #[arg(long, default_value = "data/pottery")]
        input: PathBuf,
        #[arg(long, default_value = "data/diffusers_pottery")]
        output: PathBuf,
    },
    /// Save a contact sheet and print the label distribution
    Visualize {
        #[arg(long, default_value = "data/pottery")]
        input: PathBuf,
        #[arg(long, default_value = "grid.png")]
        output: PathBuf,
        #[arg(long, default_value_t = 12)]
        count: usize,
    },
}

fn report(command: &str, summary: Summary) {
    info!(
        processed = summary.processed,
        failed = summary.failed,
        "{command} finished"
    );
}

pub async fn run(args: DatasetArgs) -> Result<()> {
    match args.command {
        Command::Download {
            dataset,
            split,
            output,
            limit,
            server_url,
        } => {
            let summary = Downloader::new(&server_url)?
                .download(&dataset, &split, &output, limit)
                .await?;
            report("download", summary);
        }
        Command::Augment {
            input,
            output,
            num_augments,
            seed,
        } => {
            let summary = tokio::task::spawn_blocking(move || {
                augment::augment_dataset(&input, &output, num_augments, seed)
            })
            .await??;
            report("augment", summary);
        }
        Command::Split {
            input,
            output,
            train,
            val,
            test,
            seed,
        } => {
            let ratios = SplitRatios { train, val, test };
            report("split", split::split_dataset(&input, &output, &ratios, seed)?);
        }
        Command::Curate {
            source,
            output,
            size,
            workers,
            no_labels,
        } => {
            let options = CurateOptions {
                size,
                workers,
                export_labels: !no_labels,
            };
            let summary = tokio::task::spawn_blocking(move || {
                curate::curate_dataset(&source, &output, &options)
            })
            .await??;
            report("curate", summary);
        }
        Command::Stats { input } => {
            println!("{}", stats::dataset_stats(&input)?);
        }
        Command::Prepare { input, output } => {
            report("prepare", prepare::prepare_for_diffusers(&input, &output)?);
        }
        Command::Visualize {
            input,
            output,
            count,
        } => {
            visualize::visualize_dataset(&input, &output, count)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn curate_parses_size_and_flags() {
        let args = DatasetArgs::try_parse_from([
            "kiln-dataset",
            "curate",
            "--source",
            "raw",
            "--output",
            "curated",
            "--size",
            "256x384",
            "--no-labels",
        ])
        .unwrap();

        match args.command {
            Command::Curate {
                size,
                workers,
                no_labels,
                ..
            } => {
                assert_eq!(size, ImageSize { width: 256, height: 384 });
                assert_eq!(workers, 8);
                assert!(no_labels);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[rstest]
    #[case(&["kiln-dataset", "curate", "--source", "a", "--output", "b", "--size", "big"])]
    #[case(&["kiln-dataset", "curate", "--output", "b"])]
    #[case(&["kiln-dataset", "shuffle"])]
    fn rejects_invalid_invocations(#[case] argv: &[&str]) {
        assert!(DatasetArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn split_defaults() {
        let args = DatasetArgs::try_parse_from(["kiln-dataset", "split"]).unwrap();
        match args.command {
            Command::Split {
                train,
                val,
                test,
                seed,
                ..
            } => assert_eq!((train, val, test, seed), (0.7, 0.15, 0.15, 42)),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
