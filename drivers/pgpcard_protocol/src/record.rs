//! 传输记录
//!
//! 每条记录以 model 标签开头：`8` 表示宽布局（64 位数据指针），其他值按窄布局（32 位数据指针）解析。
//! 解码后统一成与布局无关的 [`TxRequest`] / [`RxRequest`]，应答再按调用者的布局写回。

use deku::prelude::*;
use derive_more::Display;

/// 记录布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Model {
    /// 32 位数据指针
    Narrow = 4,
    /// 64 位数据指针
    Wide = 8,
}

impl Model {
    pub fn from_tag(tag: u32) -> Self {
        if tag == Model::Wide as u32 {
            Model::Wide
        } else {
            Model::Narrow
        }
    }

    #[inline]
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// 读取记录开头的 model 标签
    pub fn detect(record: &[u8]) -> Result<(Self, u32), ProtocolError> {
        let tag: [u8; 4] = record
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::Truncated {
                expected: 4,
                actual: record.len(),
            })?;
        let tag = u32::from_le_bytes(tag);
        Ok((Self::from_tag(tag), tag))
    }

    /// 发送记录长度
    pub fn tx_record_size(self) -> usize {
        match self {
            Model::Narrow => 24,
            Model::Wide => 32,
        }
    }

    /// 接收记录长度
    pub fn rx_record_size(self) -> usize {
        match self {
            Model::Narrow => 36,
            Model::Wide => 40,
        }
    }
}

bitflags::bitflags! {
    /// 帧错误标志
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// 帧结束错误
        const EOFE = 1 << 0;
        /// 接收 FIFO 错误
        const FIFO_ERR = 1 << 1;
        /// 长度错误（帧被截断）
        const LENGTH_ERR = 1 << 2;
    }
}

/// 记录编解码错误
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[display("record too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[display("record size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[display("malformed record: {_0}")]
    Malformed(String),
}

impl core::error::Error for ProtocolError {}

impl From<DekuError> for ProtocolError {
    fn from(e: DekuError) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct TxNarrow {
    model: u32,
    cmd: u32,
    data: u32,
    lane: u32,
    vc: u32,
    size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct TxWide {
    model: u32,
    cmd: u32,
    data: u64,
    lane: u32,
    vc: u32,
    size: u32,
    reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RxNarrow {
    model: u32,
    max_size: u32,
    data: u32,
    lane: u32,
    vc: u32,
    rx_size: u32,
    eofe: u32,
    fifo_err: u32,
    length_err: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RxWide {
    model: u32,
    max_size: u32,
    data: u64,
    lane: u32,
    vc: u32,
    rx_size: u32,
    eofe: u32,
    fifo_err: u32,
    length_err: u32,
}

fn narrow_pointer(data: u64) -> Result<u32, ProtocolError> {
    u32::try_from(data)
        .map_err(|_| ProtocolError::Malformed(format!("data pointer {data:#x} needs the wide model")))
}

/// 发送记录（与布局无关）
///
/// `cmd` 不是普通写时，`data` 是控制命令的立即参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub model: Model,
    pub cmd: u32,
    pub data: u64,
    pub lane: u32,
    pub vc: u32,
    /// 数据字数
    pub size: u32,
}

impl TxRequest {
    /// 普通写请求
    pub fn write(model: Model, lane: u32, vc: u32, data: u64, size: u32) -> Self {
        Self {
            model,
            cmd: 0,
            data,
            lane,
            vc,
            size,
        }
    }

    /// 控制命令请求
    pub fn command(model: Model, cmd: u32, arg: u64) -> Self {
        Self {
            model,
            cmd,
            data: arg,
            lane: 0,
            vc: 0,
            size: 0,
        }
    }

    /// 解码记录，长度必须与布局严格一致
    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        let (model, _) = Model::detect(record)?;
        let expected = model.tx_record_size();
        if record.len() < expected {
            return Err(ProtocolError::Truncated {
                expected,
                actual: record.len(),
            });
        }
        if record.len() > expected {
            return Err(ProtocolError::SizeMismatch {
                expected,
                actual: record.len(),
            });
        }

        let request = match model {
            Model::Narrow => {
                let (_, r) = TxNarrow::from_bytes((record, 0))?;
                Self {
                    model,
                    cmd: r.cmd,
                    data: u64::from(r.data),
                    lane: r.lane,
                    vc: r.vc,
                    size: r.size,
                }
            }
            Model::Wide => {
                let (_, r) = TxWide::from_bytes((record, 0))?;
                Self {
                    model,
                    cmd: r.cmd,
                    data: r.data,
                    lane: r.lane,
                    vc: r.vc,
                    size: r.size,
                }
            }
        };

        Ok(request)
    }

    /// 按自身布局编码
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self.model {
            Model::Narrow => TxNarrow {
                model: self.model.tag(),
                cmd: self.cmd,
                data: narrow_pointer(self.data)?,
                lane: self.lane,
                vc: self.vc,
                size: self.size,
            }
            .to_bytes()?,
            Model::Wide => TxWide {
                model: self.model.tag(),
                cmd: self.cmd,
                data: self.data,
                lane: self.lane,
                vc: self.vc,
                size: self.size,
                reserved: 0,
            }
            .to_bytes()?,
        };
        Ok(bytes)
    }
}

/// 接收请求（与布局无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRequest {
    pub model: Model,
    /// 记录中原始的 model 标签
    pub tag: u32,
    /// 调用者缓冲区能容纳的数据字数
    pub max_size: u32,
    pub data: u64,
}

/// 接收结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxCompletion {
    pub lane: u32,
    pub vc: u32,
    /// 帧的实际数据字数
    pub rx_size: u32,
    pub flags: FrameFlags,
}

impl RxRequest {
    pub fn new(model: Model, max_size: u32, data: u64) -> Self {
        Self {
            model,
            tag: model.tag(),
            max_size,
            data,
        }
    }

    /// 解码记录，长度必须与布局严格一致
    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        let (model, tag) = Model::detect(record)?;
        let expected = model.rx_record_size();
        if record.len() != expected {
            return Err(ProtocolError::SizeMismatch {
                expected,
                actual: record.len(),
            });
        }

        let (max_size, data) = match model {
            Model::Narrow => {
                let (_, r) = RxNarrow::from_bytes((record, 0))?;
                (r.max_size, u64::from(r.data))
            }
            Model::Wide => {
                let (_, r) = RxWide::from_bytes((record, 0))?;
                (r.max_size, r.data)
            }
        };

        Ok(Self {
            model,
            tag,
            max_size,
            data,
        })
    }

    /// 编码请求
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode_reply(&RxCompletion::default())
    }

    /// 按请求的布局编码应答
    pub fn encode_reply(&self, completion: &RxCompletion) -> Result<Vec<u8>, ProtocolError> {
        let flag = |f: FrameFlags| u32::from(completion.flags.contains(f));
        let bytes = match self.model {
            Model::Narrow => RxNarrow {
                model: self.tag,
                max_size: self.max_size,
                data: narrow_pointer(self.data)?,
                lane: completion.lane,
                vc: completion.vc,
                rx_size: completion.rx_size,
                eofe: flag(FrameFlags::EOFE),
                fifo_err: flag(FrameFlags::FIFO_ERR),
                length_err: flag(FrameFlags::LENGTH_ERR),
            }
            .to_bytes()?,
            Model::Wide => RxWide {
                model: self.tag,
                max_size: self.max_size,
                data: self.data,
                lane: completion.lane,
                vc: completion.vc,
                rx_size: completion.rx_size,
                eofe: flag(FrameFlags::EOFE),
                fifo_err: flag(FrameFlags::FIFO_ERR),
                length_err: flag(FrameFlags::LENGTH_ERR),
            }
            .to_bytes()?,
        };
        Ok(bytes)
    }

    /// 解码应答
    pub fn decode_reply(record: &[u8]) -> Result<(Self, RxCompletion), ProtocolError> {
        let request = Self::decode(record)?;
        let (lane, vc, rx_size, eofe, fifo_err, length_err) = match request.model {
            Model::Narrow => {
                let (_, r) = RxNarrow::from_bytes((record, 0))?;
                (r.lane, r.vc, r.rx_size, r.eofe, r.fifo_err, r.length_err)
            }
            Model::Wide => {
                let (_, r) = RxWide::from_bytes((record, 0))?;
                (r.lane, r.vc, r.rx_size, r.eofe, r.fifo_err, r.length_err)
            }
        };

        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::EOFE, eofe != 0);
        flags.set(FrameFlags::FIFO_ERR, fifo_err != 0);
        flags.set(FrameFlags::LENGTH_ERR, length_err != 0);

        Ok((
            request,
            RxCompletion {
                lane,
                vc,
                rx_size,
                flags,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_layouts() {
        for model in [Model::Narrow, Model::Wide] {
            let tx = TxRequest::write(model, 1, 2, 0x1000, 3).encode().unwrap();
            assert_eq!(tx.len(), model.tx_record_size());
            let rx = RxRequest::new(model, 4, 0x2000).encode().unwrap();
            assert_eq!(rx.len(), model.rx_record_size());
        }
    }

    #[test]
    fn narrow_tx_layout_is_packed_words() {
        let bytes = TxRequest::write(Model::Narrow, 3, 1, 0xDEAD_BEEF, 500_000)
            .encode()
            .unwrap();
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![4, 0, 0xDEAD_BEEF, 3, 1, 500_000]);
    }

    #[test]
    fn wide_tx_carries_64bit_pointer() {
        let request = TxRequest::write(Model::Wide, 7, 3, 0x7FFF_0000_1234, 16);
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[8..16], &0x7FFF_0000_1234u64.to_le_bytes());

        assert_eq!(TxRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn unknown_tag_decodes_as_narrow() {
        let mut bytes = TxRequest::command(Model::Narrow, 0x10, 2).encode().unwrap();
        bytes[..4].copy_from_slice(&0u32.to_le_bytes());
        let decoded = TxRequest::decode(&bytes).unwrap();
        assert_eq!(decoded.model, Model::Narrow);
        assert_eq!(decoded.cmd, 0x10);
        assert_eq!(decoded.data, 2);
    }

    #[test]
    fn tx_size_must_match_model() {
        let mut bytes = TxRequest::write(Model::Narrow, 0, 0, 0x10, 1).encode().unwrap();
        bytes.extend_from_slice(&[0; 8]);
        assert_eq!(
            TxRequest::decode(&bytes),
            Err(ProtocolError::SizeMismatch {
                expected: 24,
                actual: 32
            })
        );

        assert!(matches!(
            TxRequest::decode(&bytes[..10]),
            Err(ProtocolError::Truncated { expected: 24, .. })
        ));
    }

    #[test]
    fn narrow_layout_rejects_wide_pointer() {
        let request = TxRequest::write(Model::Narrow, 0, 0, 0x1_0000_0000, 1);
        assert!(matches!(request.encode(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn rx_size_must_match_model() {
        let bytes = RxRequest::new(Model::Wide, 8, 0x1000).encode().unwrap();
        assert_eq!(
            RxRequest::decode(&bytes[..36]),
            Err(ProtocolError::SizeMismatch {
                expected: 40,
                actual: 36
            })
        );
        assert!(matches!(
            RxRequest::decode(&bytes[..2]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn rx_reply_preserves_request_fields() {
        for model in [Model::Narrow, Model::Wide] {
            let request = RxRequest::new(model, 100, 0x4000);
            let completion = RxCompletion {
                lane: 3,
                vc: 1,
                rx_size: 120,
                flags: FrameFlags::LENGTH_ERR | FrameFlags::EOFE,
            };
            let reply = request.encode_reply(&completion).unwrap();
            let (decoded, got) = RxRequest::decode_reply(&reply).unwrap();
            assert_eq!(decoded, request);
            assert_eq!(got, completion);
        }
    }
}
