pub mod config;
pub mod logging;
pub mod memory;
pub mod storage;
pub mod users;

pub use config::{load_config, resolve_data_dir, save_config, ConfigError, ConnectorConfig};
pub use memory::MemoryUsersConnector;
pub use storage::{Storage, StorageError, StorageOptions, Uid, UserRow};
pub use users::{ConnectorError, SqliteUsersConnector, UserUpdate, UserView, UsersConnector};
