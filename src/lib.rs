//! mic-stream
//!
//! PDM 麦克风实时推流：每个固定服务周期向主机交出一个等时包。
//!
//! - `audio`: 格式表、包尺寸、lock-free FIFO、统计
//! - `capture`: 采集源契约与模拟 PDM 外设
//! - `clock`: 音频子系统时钟
//! - `stream`: ping/pong 双缓冲 streaming arbiter
//! - `control`: 主机控制请求解码
//! - `session`: 启动顺序与挂起/恢复监督

pub mod audio;
pub mod capture;
pub mod clock;
pub mod config;
pub mod control;
pub mod session;
pub mod stream;

pub use config::StreamConfig;
