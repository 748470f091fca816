//! 面板通信协议类型定义
//!
//! 此模块定义了节点与面板之间交换的数据结构，
//! 以及节点访问面板的 `PanelApi` trait。

pub mod panel;
pub mod server;
pub mod status;
pub mod user;
