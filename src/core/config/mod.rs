pub mod defaults;
pub mod error;
pub mod paths;
pub mod service;
pub mod validation;

pub use defaults::{
    AppConfig, ControllerConfig, FieldMapping, IndexConfig, LlmConfig, SearchConfig,
    ServerConfig, StoreConfig, DEFAULT_SCOPE,
};
pub use error::ConfigError;
pub use paths::AppPaths;
pub use service::ConfigService;
