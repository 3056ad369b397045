pub mod archive;
pub mod exporter;
pub mod parser;
pub mod types;

pub use exporter::{export_profile, ExportReport, ExportSpec};
pub use parser::{parse_index, read_archive_metadata};
pub use types::*;
