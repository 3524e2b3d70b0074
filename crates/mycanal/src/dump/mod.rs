//! Initial snapshot through mysqldump
//!
//! The canal runs mysqldump once before streaming the binlog when it has
//! no stored position. [`Dumper`] drives the process and [`DumpParser`]
//! turns its output into [`DumpItem`]s: row values, plus the binlog
//! coordinates and GTID set the stream should continue from.

mod dumper;
mod parser;

pub use dumper::{find_executable, supports_source_data, Dumper};
pub use parser::{parse_stream, parse_values, unescape_string, DumpItem, DumpParser};
