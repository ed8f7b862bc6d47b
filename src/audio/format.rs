//! 音频格式与 isochronous 包尺寸
//!
//! 所有尺寸都以「word」为单位计量：一个 word = 一个 PCM 样本（16-bit 时 2 字节）
//!
//! 包尺寸 = 每个服务周期的标称样本数 + 一个 sub-frame 的漂移余量：
//! - 44.1kHz / 立体声 / 16-bit / 1ms：176 字节标称 + 4 字节余量 = 180 字节（90 words）

/// 16 kHz
pub const SAMPLE_RATE_16K: u32 = 16_000;
/// 22.05 kHz
pub const SAMPLE_RATE_22K: u32 = 22_050;
/// 32 kHz
pub const SAMPLE_RATE_32K: u32 = 32_000;
/// 44.1 kHz
pub const SAMPLE_RATE_44K: u32 = 44_100;

/// 默认服务周期（毫秒）
pub const DEFAULT_SERVICE_INTERVAL_MS: u32 = 1;

/// PDM/PCM 抽取率
pub const PDM_DECIMATION_RATE: u32 = 64;

/// 支持的格式表（顺序固定，索引即 FormatSelection）
///
/// 最后一项是上电默认格式，主机无法通过 alt setting 重新选中它
/// （见 `control::alt_setting_for`）
pub const SUPPORTED_FORMATS: [AudioFormat; 4] = [
    AudioFormat::new(SAMPLE_RATE_16K, 2, 16),
    AudioFormat::new(SAMPLE_RATE_22K, 2, 16),
    AudioFormat::new(SAMPLE_RATE_32K, 2, 16),
    AudioFormat::new(SAMPLE_RATE_44K, 2, 16),
];

/// 上电默认格式：44.1kHz
pub const DEFAULT_FORMAT_INDEX: usize = 3;

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 创建新的音频格式
    pub const fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// 每样本的字节数（= 一个 word）
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// 每帧的字节数（所有声道各一个样本，即一个 sub-frame）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 每毫秒产生的 word 数（PDM 抽取后的 FIFO 填充速率）
    #[inline]
    pub fn words_per_ms(&self) -> usize {
        self.sample_rate as usize * self.channels as usize / 1000
    }

    /// 该采样率需要的音频子系统时钟
    pub fn audio_clock_hz(&self) -> u32 {
        audio_clock_hz(self.sample_rate)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        SUPPORTED_FORMATS[DEFAULT_FORMAT_INDEX]
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// 按索引查找支持的格式
pub fn format_at(index: usize) -> Option<AudioFormat> {
    SUPPORTED_FORMATS.get(index).copied()
}

/// 音频子系统时钟频率
///
/// - 22.05 kHz / 44.1 kHz 系列：22.5792 MHz
/// - 其他（16 / 32 kHz 系列）：24.576 MHz
pub fn audio_clock_hz(sample_rate: u32) -> u32 {
    match sample_rate {
        SAMPLE_RATE_22K | SAMPLE_RATE_44K => 22_579_200,
        _ => 24_576_000,
    }
}

/// 单个服务周期的包尺寸
///
/// `capacity_words` 已包含 `slack_words`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketGeometry {
    capacity_words: usize,
    slack_words: usize,
    bytes_per_word: usize,
}

impl PacketGeometry {
    pub fn new(capacity_words: usize, slack_words: usize, bytes_per_word: usize) -> Self {
        assert!(
            slack_words < capacity_words,
            "drift slack must leave room for nominal samples"
        );
        Self {
            capacity_words,
            slack_words,
            bytes_per_word,
        }
    }

    /// 根据格式和服务周期计算包尺寸
    pub fn for_format(format: &AudioFormat, interval_ms: u32) -> Self {
        let bytes_per_word = format.bytes_per_sample().max(1);
        let nominal_bytes = format.sample_rate as usize
            * format.bytes_per_frame()
            * interval_ms as usize
            / 1000;
        // 余量固定为一个 sub-frame，用于偶尔发送多一帧
        let slack_bytes = format.bytes_per_frame();
        let capacity_bytes = nominal_bytes + slack_bytes;

        Self::new(
            capacity_bytes / bytes_per_word,
            slack_bytes / bytes_per_word,
            bytes_per_word,
        )
    }

    /// 缓冲区容量（含余量）
    #[inline]
    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    #[inline]
    pub fn slack_words(&self) -> usize {
        self.slack_words
    }

    /// 标称 word 数（不含余量）
    #[inline]
    pub fn nominal_words(&self) -> usize {
        self.capacity_words - self.slack_words
    }

    #[inline]
    pub fn bytes_per_word(&self) -> usize {
        self.bytes_per_word
    }

    /// Endpoint 最大包长（字节）
    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_words * self.bytes_per_word
    }

    /// 标称包长（字节），静音帧和启动帧使用该长度
    #[inline]
    pub fn nominal_bytes(&self) -> usize {
        self.nominal_words() * self.bytes_per_word
    }

    /// 漂移补偿：根据 FIFO 水位决定本周期读取多少 word
    ///
    /// - 水位 >= 容量：读满容量，消化积压（不会溢出缓冲区）
    /// - 否则：读 `容量 - 余量`，避免把下一周期读空
    #[inline]
    pub fn request_words(&self, fifo_level: usize) -> usize {
        if fifo_level >= self.capacity_words {
            self.capacity_words
        } else {
            self.nominal_words()
        }
    }
}

/// 格式表中最大的包尺寸（用于分配 ping/pong 缓冲区）
pub fn max_capacity_words(interval_ms: u32) -> usize {
    SUPPORTED_FORMATS
        .iter()
        .map(|f| PacketGeometry::for_format(f, interval_ms).capacity_words())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_44k_stereo_geometry() {
        let format = AudioFormat::new(SAMPLE_RATE_44K, 2, 16);
        let geometry = PacketGeometry::for_format(&format, 1);

        // 44100 * 4 / 1000 = 176 字节 + 4 字节余量
        assert_eq!(geometry.capacity_bytes(), 180);
        assert_eq!(geometry.capacity_words(), 90);
        assert_eq!(geometry.slack_words(), 2);
        assert_eq!(geometry.nominal_bytes(), 176);
    }

    #[test]
    fn test_22k_truncates_partial_frame() {
        let format = AudioFormat::new(SAMPLE_RATE_22K, 2, 16);
        let geometry = PacketGeometry::for_format(&format, 1);

        // 22050 * 4 / 1000 = 88.2 → 88 字节
        assert_eq!(geometry.nominal_bytes(), 88);
        assert_eq!(geometry.capacity_words(), 46);
    }

    #[test]
    fn test_request_words_boundaries() {
        let geometry = PacketGeometry::new(88, 2, 2);

        // 水位超过容量：截断到容量
        assert_eq!(geometry.request_words(90), 88);
        // 水位恰好等于容量：读满
        assert_eq!(geometry.request_words(88), 88);
        // 水位低于容量：保守读取
        assert_eq!(geometry.request_words(87), 86);
        assert_eq!(geometry.request_words(85), 86);
        assert_eq!(geometry.request_words(60), 86);
        assert_eq!(geometry.request_words(0), 86);
    }

    #[test]
    fn test_audio_clock_by_rate() {
        assert_eq!(audio_clock_hz(SAMPLE_RATE_44K), 22_579_200);
        assert_eq!(audio_clock_hz(SAMPLE_RATE_22K), 22_579_200);
        assert_eq!(audio_clock_hz(SAMPLE_RATE_16K), 24_576_000);
        assert_eq!(audio_clock_hz(SAMPLE_RATE_32K), 24_576_000);
    }

    #[test]
    fn test_default_format_is_44k() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, SAMPLE_RATE_44K);
        assert_eq!(format.words_per_ms(), 88);
        assert_eq!(max_capacity_words(1), 90);
    }

    #[test]
    #[should_panic]
    fn test_slack_larger_than_capacity_panics() {
        let _ = PacketGeometry::new(2, 2, 2);
    }
}
