//! Profile a workload and print it as a Firefox Profiler JSON document.
//!
//! `cargo run --example firefox > profile.json`, then load the file into
//! https://profiler.firefox.com

#[path = "workload/letters.rs"]
mod letters;
#[path = "workload/numbers.rs"]
mod numbers;

use memhogs::{FirefoxProfile, GroupKey, ProfileReport, RunSettings, TrackingAllocator};

const MAX_FRAME_LENGTH: usize = 128;
const MAX_LOG_COUNT: usize = 1_024 * 10;
#[global_allocator]
static ALLOCATOR: TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT> = TrackingAllocator::new();

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = RunSettings::builder("get_letters_and_numbers")
        .target_files([letters::FILE, numbers::FILE])
        .group_key(GroupKey::Traceback)
        .build()?;

    let report = ProfileReport::run(&ALLOCATOR, settings, || {
        (letters::get_letters(), numbers::get_numbers())
    })?;

    let profile = FirefoxProfile::from_report(&report);
    println!("{}", profile.to_json_string()?);

    Ok(())
}
