pub mod catalog;
pub mod llm;
pub mod models;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::catalog;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::registry;
    pub use crate::server;
    pub use crate::session;
    pub use crate::store;
    pub use crate::telemetry;
    pub use crate::transport;
}
