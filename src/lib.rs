#![doc = include_str!("../README.md")]

mod alloc;
mod diff;
mod document;
mod error;
mod filter;
mod firefox;
mod report;
mod settings;
mod slot;
mod snapshot;
mod source;
mod tracer;
mod view;

pub use alloc::*;
pub use diff::*;
pub use document::*;
pub use error::*;
pub use filter::*;
pub use firefox::*;
pub use report::*;
pub use settings::*;
pub use snapshot::*;
pub use source::*;
pub use tracer::*;
pub use view::*;
