pub mod logging;
pub mod machine;

pub use logging::{default_log_file, init_logging};
