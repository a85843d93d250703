//! 足迹 K 线存储的领域模型、存储契约与配置。
//!
//! 本 crate 不做任何 I/O，具体后端位于 `footprint-store`。

pub mod common;
pub mod config;
pub mod market;
pub mod store;
