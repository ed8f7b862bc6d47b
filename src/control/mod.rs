//! 音频类控制请求解码
//!
//! 在控制传输上下文中调用，可能与 streaming arbiter 并发执行：
//! 只读写 [`SharedControlState`] 中的原子标志，从不阻塞
//!
//! 返回约定：`Ok(n)` 表示已处理（GET 请求写入了 n 字节回复），
//! `Err` 表示未处理，协议栈应 STALL 该请求

use std::sync::Arc;

use crate::audio::format::SUPPORTED_FORMATS;
use crate::stream::SharedControlState;

/// 事件编号（协议栈回调 ABI）
pub mod codes {
    pub const RECORD_START: u8 = 0x01;
    pub const RECORD_STOP: u8 = 0x02;
    pub const PLAYBACK_START: u8 = 0x03;
    pub const PLAYBACK_STOP: u8 = 0x04;

    pub const SET_CUR: u8 = 0x11;
    pub const SET_MIN: u8 = 0x12;
    pub const SET_MAX: u8 = 0x13;
    pub const SET_RES: u8 = 0x14;

    pub const GET_CUR: u8 = 0x21;
    pub const GET_MIN: u8 = 0x22;
    pub const GET_MAX: u8 = 0x23;
    pub const GET_RES: u8 = 0x24;

    pub const MUTE_CONTROL: u8 = 0x01;
    pub const VOLUME_CONTROL: u8 = 0x02;
    pub const SAMPLING_FREQ_CONTROL: u8 = 0x81;
}

/// 默认 feature unit ID
pub const DEFAULT_FEATURE_UNIT_ID: u8 = 2;

/// 音量桩值（8.8 定点，小端）：最小 -15 dB，最大 0 dB，步进 1/256 dB
const VOLUME_CUR: [u8; 2] = [0x00, 0x00];
const VOLUME_MIN: [u8; 2] = [0x00, 0xF1];
const VOLUME_MAX: [u8; 2] = [0x00, 0x00];
const VOLUME_RES: [u8; 2] = [0x00, 0x01];
const ZERO_REPLY: [u8; 2] = [0x00, 0x00];

/// 选择格式表第 `format_index` 项的 alt setting
///
/// alt 0 是零带宽设置，alt n 对应第 n-1 项且要求 n < 格式数，
/// 所以最后一项（上电默认格式）没有对应的 alt setting
pub fn alt_setting_for(format_index: usize) -> Option<u8> {
    let alt = format_index + 1;
    if alt < SUPPORTED_FORMATS.len() {
        u8::try_from(alt).ok()
    } else {
        None
    }
}

/// 控制事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    RecordStart,
    RecordStop,
    PlaybackStart,
    PlaybackStop,
    SetCur,
    SetMin,
    SetMax,
    SetRes,
    GetCur,
    GetMin,
    GetMax,
    GetRes,
    Other(u8),
}

impl ControlEvent {
    pub fn from_code(code: u8) -> Self {
        match code {
            codes::RECORD_START => Self::RecordStart,
            codes::RECORD_STOP => Self::RecordStop,
            codes::PLAYBACK_START => Self::PlaybackStart,
            codes::PLAYBACK_STOP => Self::PlaybackStop,
            codes::SET_CUR => Self::SetCur,
            codes::SET_MIN => Self::SetMin,
            codes::SET_MAX => Self::SetMax,
            codes::SET_RES => Self::SetRes,
            codes::GET_CUR => Self::GetCur,
            codes::GET_MIN => Self::GetMin,
            codes::GET_MAX => Self::GetMax,
            codes::GET_RES => Self::GetRes,
            other => Self::Other(other),
        }
    }
}

/// 控制选择子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSelector {
    Mute,
    Volume,
    SamplingFreq,
    Other(u8),
}

impl ControlSelector {
    pub fn from_code(code: u8) -> Self {
        match code {
            codes::MUTE_CONTROL => Self::Mute,
            codes::VOLUME_CONTROL => Self::Volume,
            codes::SAMPLING_FREQ_CONTROL => Self::SamplingFreq,
            other => Self::Other(other),
        }
    }
}

/// 一次控制请求
///
/// 录音/播放事件的 unit 和 selector 为 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub event: ControlEvent,
    pub unit_id: u8,
    pub selector: ControlSelector,
    pub interface: u8,
    pub alt_setting: u8,
}

impl ControlRequest {
    /// 不带 unit/selector 的事件（RecordStart 等）
    pub fn event(event: ControlEvent) -> Self {
        Self {
            event,
            unit_id: 0,
            selector: ControlSelector::Other(0),
            interface: 0,
            alt_setting: 0,
        }
    }

    /// 针对某个 unit 的控制请求
    pub fn control(event: ControlEvent, unit_id: u8, selector: ControlSelector) -> Self {
        Self {
            event,
            unit_id,
            selector,
            interface: 0,
            alt_setting: 0,
        }
    }

    pub fn with_alt_setting(mut self, alt_setting: u8) -> Self {
        self.alt_setting = alt_setting;
        self
    }
}

/// 未处理的控制请求
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("unsupported control event {0:?}")]
    UnsupportedEvent(ControlEvent),
    #[error("unsupported control selector {selector:?} for {event:?}")]
    UnsupportedSelector {
        event: ControlEvent,
        selector: ControlSelector,
    },
    #[error("payload length {actual}, expected {expected}")]
    PayloadLength { expected: usize, actual: usize },
    #[error("reply buffer holds {available} bytes, need {needed}")]
    ReplyTooShort { needed: usize, available: usize },
}

impl ControlError {
    /// 回调 ABI 返回值：非 0 表示 STALL
    pub fn status(&self) -> i32 {
        1
    }
}

/// 控制面
pub struct ControlSurface {
    shared: Arc<SharedControlState>,
    feature_unit_id: u8,
    format_count: usize,
}

impl ControlSurface {
    pub fn new(shared: Arc<SharedControlState>, feature_unit_id: u8) -> Self {
        Self {
            shared,
            feature_unit_id,
            format_count: SUPPORTED_FORMATS.len(),
        }
    }

    pub fn feature_unit_id(&self) -> u8 {
        self.feature_unit_id
    }

    /// 协议栈回调入口：0 = 已处理，非 0 = STALL
    pub fn callback(
        &self,
        event: u8,
        unit_id: u8,
        selector: u8,
        buffer: &mut [u8],
        interface: u8,
        alt_setting: u8,
    ) -> i32 {
        let request = ControlRequest {
            event: ControlEvent::from_code(event),
            unit_id,
            selector: ControlSelector::from_code(selector),
            interface,
            alt_setting,
        };

        match self.handle(&request, buffer) {
            Ok(_) => 0,
            Err(e) => {
                log::debug!("Control request stalled: {} ({:?})", e, request);
                e.status()
            }
        }
    }

    /// 处理一次控制请求
    ///
    /// SET 请求：`buffer` 为主机发来的数据；GET 请求：`buffer` 用于写入回复
    pub fn handle(&self, request: &ControlRequest, buffer: &mut [u8]) -> Result<usize, ControlError> {
        match request.event {
            ControlEvent::RecordStart => {
                log::debug!("Host enabled recording");
                self.shared.request_start();
                Ok(0)
            }
            ControlEvent::RecordStop => {
                // 部分主机从不发送该事件，由 session supervisor 兜底
                log::debug!("Host disabled recording");
                self.shared.request_stop();
                Ok(0)
            }
            // 没有 OUT 通路
            ControlEvent::PlaybackStart | ControlEvent::PlaybackStop => Ok(0),

            ControlEvent::SetCur => self.set_cur(request, buffer),
            ControlEvent::SetMin | ControlEvent::SetMax | ControlEvent::SetRes => Ok(0),

            ControlEvent::GetCur => self.get_cur(request, buffer),
            ControlEvent::GetMin => {
                let reply = match request.selector {
                    ControlSelector::Volume => &VOLUME_MIN,
                    _ => &ZERO_REPLY,
                };
                write_reply(buffer, reply)
            }
            ControlEvent::GetMax => {
                let reply = match request.selector {
                    ControlSelector::Volume => &VOLUME_MAX,
                    _ => &ZERO_REPLY,
                };
                write_reply(buffer, reply)
            }
            ControlEvent::GetRes => {
                let reply = match request.selector {
                    ControlSelector::Volume => &VOLUME_RES,
                    _ => &ZERO_REPLY,
                };
                write_reply(buffer, reply)
            }

            ControlEvent::Other(_) => Err(ControlError::UnsupportedEvent(request.event)),
        }
    }

    fn set_cur(&self, request: &ControlRequest, payload: &[u8]) -> Result<usize, ControlError> {
        match request.selector {
            ControlSelector::Mute => {
                expect_len(payload, 1)?;
                if request.unit_id == self.feature_unit_id {
                    let muted = payload[0] != 0;
                    log::debug!("Mute {}", if muted { "on" } else { "off" });
                    self.shared.set_muted(muted);
                }
                Ok(0)
            }
            // 音量不作用于采集数据
            ControlSelector::Volume => Ok(0),
            ControlSelector::SamplingFreq => {
                expect_len(payload, 3)?;
                if request.unit_id == self.feature_unit_id {
                    let requested = u32::from_le_bytes([payload[0], payload[1], payload[2], 0]);
                    let alt = request.alt_setting as usize;
                    // 主机会探测范围：越界请求静默忽略
                    if alt > 0 && alt < self.format_count {
                        self.shared.set_format_index(alt - 1);
                        log::debug!(
                            "Sample rate selection: alt {} → {} Hz (host asked {} Hz)",
                            alt,
                            SUPPORTED_FORMATS[alt - 1].sample_rate,
                            requested
                        );
                    } else {
                        log::debug!("Ignoring sample rate request for alt setting {}", alt);
                    }
                }
                Ok(0)
            }
            ControlSelector::Other(_) => Err(ControlError::UnsupportedSelector {
                event: request.event,
                selector: request.selector,
            }),
        }
    }

    fn get_cur(&self, request: &ControlRequest, buffer: &mut [u8]) -> Result<usize, ControlError> {
        match request.selector {
            ControlSelector::Mute => write_reply(buffer, &[self.shared.is_muted() as u8]),
            ControlSelector::Volume => write_reply(buffer, &VOLUME_CUR),
            ControlSelector::SamplingFreq => {
                if request.unit_id != self.feature_unit_id {
                    return Ok(0);
                }
                let rate = SUPPORTED_FORMATS
                    .get(self.shared.format_index())
                    .copied()
                    .unwrap_or_default()
                    .sample_rate;
                let bytes = rate.to_le_bytes();
                write_reply(buffer, &bytes[..3])
            }
            ControlSelector::Other(_) => write_reply(buffer, &ZERO_REPLY),
        }
    }
}

fn expect_len(payload: &[u8], expected: usize) -> Result<(), ControlError> {
    if payload.len() != expected {
        return Err(ControlError::PayloadLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn write_reply(buffer: &mut [u8], reply: &[u8]) -> Result<usize, ControlError> {
    if buffer.len() < reply.len() {
        return Err(ControlError::ReplyTooShort {
            needed: reply.len(),
            available: buffer.len(),
        });
    }
    buffer[..reply.len()].copy_from_slice(reply);
    Ok(reply.len())
}
