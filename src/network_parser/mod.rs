//! 网络相关：请求签名、传输层接口与页面解析。

pub mod page_parser;
pub mod signer;
pub mod transport;
