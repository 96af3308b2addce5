use clap::Parser;

use log::{error, info};
use std::process::ExitCode;

use labelbox2detector::types::ProcessingStats;
use labelbox2detector::utils::create_progress_bar;
use labelbox2detector::{read_labelbox_export_file, rows_from_records, write_dataset, ConvertArgs};

fn run(args: &ConvertArgs) -> Result<(), Box<dyn std::error::Error>> {
    let records = read_labelbox_export_file(&args.json_input_file)?;
    info!(
        "Read {} records from {}",
        records.len(),
        args.json_input_file.display()
    );

    let stats = ProcessingStats::new();
    let pb = create_progress_bar(records.len() as u64, "Convert");
    let rows = rows_from_records(&records, &args.images_dir, &stats, &pb)?;
    pb.finish_with_message("Conversion complete");

    let pb = create_progress_bar(rows.len() as u64, "Copy");
    let dataset = write_dataset(rows, &args.images_dir, &args.output, &pb)?;
    pb.finish_with_message("Copy complete");

    stats.print_summary();
    info!("{}", dataset);
    Ok(())
}

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = ConvertArgs::parse();

    if !args.images_dir.is_dir() {
        error!(
            "The specified images_dir does not exist: {}",
            args.images_dir.display()
        );
        return ExitCode::FAILURE;
    }

    info!("Starting the conversion process...");

    match run(&args) {
        Ok(()) => {
            info!("Dataset written to {}", args.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to convert {}: {}", args.json_input_file.display(), e);
            ExitCode::FAILURE
        }
    }
}
