//! PGP 卡驱动的通信协议定义
//!
//! 调用者与驱动之间交换的记录：传输记录（窄/宽两种布局）、控制命令编码和状态快照。

pub mod command;
pub mod record;
pub mod status;

pub use command::Command;
pub use record::{FrameFlags, Model, ProtocolError, RxCompletion, RxRequest, TxRequest};
pub use status::{BuildStamp, PgpCardStatus};

/// 通道（lane）数量
pub const LANE_COUNT: usize = 8;
/// 每个通道的虚拟通道数量
pub const VC_COUNT: usize = 4;
/// 负载单位：每个数据字 4 字节
pub const WORD_SIZE: usize = 4;
