//! 节点与面板之间的共享类型
//!
//! 包括面板下发的服务端配置、用户列表、上报数据结构，
//! 以及节点消费面板接口的 `PanelApi` trait。

pub mod error;
pub mod protocol;

pub use error::PanelError;
pub use protocol::panel::{PanelApi, ServerConfigApi};
