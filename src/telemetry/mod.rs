pub mod parser;
pub mod types;

pub use parser::{parse_line, parse_readings};
pub use types::*;
