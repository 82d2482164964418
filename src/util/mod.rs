pub mod config;
pub mod http_client; // [global] HTTP客户端模块
pub mod log;
pub mod logging;
