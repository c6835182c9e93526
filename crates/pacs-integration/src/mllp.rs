//! MLLP流编解码
//!
//! 帧格式: `0x0B` + 消息 + `0x1C 0x0D`。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::IntegrationError;
use crate::hl7::{MLLP_CARRIAGE_RETURN, MLLP_END_BLOCK, MLLP_START_BLOCK};

/// 默认最大帧长度 (1 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MllpCodec {
    max_frame_length: usize,
}

impl MllpCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MllpCodec {
    type Item = BytesMut;
    type Error = IntegrationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // 丢弃起始块之前的字节
            match src.iter().position(|b| *b == MLLP_START_BLOCK) {
                Some(0) => {}
                Some(start) => {
                    warn!("丢弃MLLP起始块前的 {} 字节", start);
                    src.advance(start);
                }
                None => {
                    if !src.is_empty() {
                        warn!("丢弃无起始块的 {} 字节", src.len());
                        src.clear();
                    }
                    return Ok(None);
                }
            }

            let end = src
                .windows(2)
                .position(|w| w[0] == MLLP_END_BLOCK && w[1] == MLLP_CARRIAGE_RETURN);

            match end {
                Some(end) if end - 1 > self.max_frame_length => {
                    warn!("丢弃超长MLLP帧: {} 字节", end - 1);
                    src.advance(end + 2);
                }
                Some(end) => {
                    let mut frame = src.split_to(end + 2);
                    frame.advance(1);
                    frame.truncate(end - 1);
                    return Ok(Some(frame));
                }
                None if src.len() > self.max_frame_length + 3 => {
                    // 超长帧没有结束块时整体丢弃，等待下一个起始块
                    warn!("MLLP帧超过上限 {} 字节，丢弃已缓冲数据", self.max_frame_length);
                    src.advance(1);
                    let next = src.iter().position(|b| *b == MLLP_START_BLOCK).unwrap_or(src.len());
                    src.advance(next);
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Bytes> for MllpCodec {
    type Error = IntegrationError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 3);
        dst.put_u8(MLLP_START_BLOCK);
        dst.put_slice(&item);
        dst.put_u8(MLLP_END_BLOCK);
        dst.put_u8(MLLP_CARRIAGE_RETURN);
        Ok(())
    }
}
