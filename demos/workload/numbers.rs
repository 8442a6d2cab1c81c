use std::sync::Mutex;

pub const FILE: &str = file!();

// Grows on every call, so the comparisons show a steady increase.
static HISTORY: Mutex<Vec<Vec<u64>>> = Mutex::new(Vec::new());

pub fn get_numbers() -> Vec<u64> {
    let numbers: Vec<u64> = (0..4_096).collect();
    if let Ok(mut history) = HISTORY.lock() {
        history.push(numbers.clone());
    }
    numbers
}
