//! Profile a workload spread over two files and print the text report.
//!
//! Pass a JSON settings document as the first argument to override the defaults, e.g.
//! `cargo run --example letters_and_numbers -- '{"target_label": "x", "group_key": "TRACEBACK", "exclusive_filter": false}'`

#[path = "workload/letters.rs"]
mod letters;
#[path = "workload/numbers.rs"]
mod numbers;

use memhogs::{ProfileReport, RunSettings, TrackingAllocator};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;

// This is the maximum length of a frame
const MAX_FRAME_LENGTH: usize = 64;
// Maximum number of allocator events to keep per run
const MAX_LOG_COUNT: usize = 1_024 * 10;
#[global_allocator]
static ALLOCATOR: TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT> = TrackingAllocator::new();

fn get_letters_and_numbers() -> (Vec<String>, Vec<u64>) {
    (letters::get_letters(), numbers::get_numbers())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_log()?;

    let settings = match std::env::args().nth(1) {
        Some(json) => RunSettings::from_json(&json)?,
        None => RunSettings::builder("get_letters_and_numbers")
            .target_files([letters::FILE, numbers::FILE])
            .build()?,
    };

    let report = ProfileReport::run(&ALLOCATOR, settings, get_letters_and_numbers)?;
    println!("{report}");

    Ok(())
}

fn init_log() -> Result<(), Box<dyn std::error::Error>> {
    let stderr_logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_line_number(true)
        .with_writer(std::io::stderr);

    let registry =
        tracing_subscriber::registry().with(stderr_logger.with_filter(LevelFilter::DEBUG));

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}
