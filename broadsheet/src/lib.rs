pub mod handlers;

pub use handlers::{
    Context, Stage, expand_database_url, load_sources_from_file, parse_source_line, sqlite_file,
};
