//! 等时流 (isochronous stream) 仲裁
//!
//! - `shared`: 控制上下文与服务周期上下文之间的原子标志
//! - `buffer`: ping/pong 定长样本缓冲区
//! - `arbiter`: 每个服务周期决定交给主机的帧

pub mod arbiter;
pub mod buffer;
pub mod shared;

pub use arbiter::{FrameSource, Packet, StreamingArbiter};
pub use buffer::{BufferTag, SampleBuffer};
pub use shared::{RecordingState, SharedControlState};
