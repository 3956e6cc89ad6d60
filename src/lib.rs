pub mod config;
pub mod device;
pub mod driver;
pub mod models;
pub mod query_ast;
pub mod scalar_types;
pub mod session;
pub mod value;

pub use config::DeviceConfig;
pub use device::{Device, PreparedPlan};
pub use session::{CursorId, DeviceError, DeviceSession};
pub use value::{Row, StreamId, Value};

/// Loads `.env` and starts `env_logger` with debug output for this crate.
pub fn init_logging() {
    dotenv::dotenv().ok();
    let _ = env_logger::Builder::from_default_env()
        .filter_module("sqldevice", log::LevelFilter::Debug)
        .is_test(false)
        .try_init();
}
