//! Core types shared by every WarpEngine crate: keys, values, record
//! metadata, the error taxonomy, tunable limits, and frozen open-time
//! configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod key;
pub mod limits;
pub mod types;
pub mod value;

pub use error::Error;
pub use key::Key;
pub use limits::Limits;
pub use types::{ConsistencyMode, ShardId, Timestamp};
pub use value::{RecordMeta, Value};

pub type Result<T> = std::result::Result<T, Error>;
