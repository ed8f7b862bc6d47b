//! 会话生命周期
//!
//! - 一次性启动顺序：时钟 → 采集格式 → 总线上线 → 等待主机枚举 → 开始推流
//! - 长驻轮询：每个时间片采样一次总线挂起标志，按电平触发启停推流
//!
//! 主机挂起设备时不一定会先发送停止录音，所以挂起时这里一并清除录音标志

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::audio::AudioFormat;
use crate::capture::{CaptureError, CaptureSource};
use crate::clock::{AudioClock, ClockError};
use crate::config::StreamConfig;
use crate::stream::SharedControlState;

/// 总线契约
///
/// 方法都取 `&self`：总线状态同时被 supervisor、低层 tick 和传输上下文观察
pub trait UsbBus: Send + Sync {
    /// 使设备对主机可见
    fn start(&self);
    /// 主机是否已完成枚举与配置
    fn is_configured(&self) -> bool;
    fn is_suspended(&self) -> bool;
    fn start_streaming(&self);
    fn stop_streaming(&self);
}

/// 启动错误（致命）
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("clock configuration failed: {0}")]
    Clock(#[from] ClockError),
    #[error("capture configuration failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("host did not configure the device within {0:?}")]
    EnumerationTimeout(Duration),
}

/// 连接状态通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(DateTime<Local>),
    Disconnected(DateTime<Local>),
}

impl SessionEvent {
    pub fn timestamp(&self) -> DateTime<Local> {
        match self {
            Self::Connected(at) | Self::Disconnected(at) => *at,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = if self.is_connected() {
            "connected"
        } else {
            "disconnected"
        };
        write!(f, "[{}] host {}", self.timestamp().format("%H:%M:%S%.3f"), what)
    }
}

/// 会话监督者
pub struct SessionSupervisor<B: UsbBus> {
    bus: Arc<B>,
    shared: Arc<SharedControlState>,
    suspended: Arc<AtomicBool>,
    active: bool,
    slice: Duration,
    enumeration_timeout: Duration,
}

impl<B: UsbBus> SessionSupervisor<B> {
    pub fn new(
        bus: Arc<B>,
        shared: Arc<SharedControlState>,
        suspended: Arc<AtomicBool>,
        config: &StreamConfig,
    ) -> Self {
        Self {
            bus,
            shared,
            suspended,
            active: false,
            slice: Duration::from_millis(config.supervisor_slice_ms),
            enumeration_timeout: Duration::from_millis(config.enumeration_timeout_ms),
        }
    }

    /// 当前是否在推流
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// 一次性启动
    ///
    /// 时钟或格式失败直接返回错误，不会让设备上线
    pub fn startup<K, C>(
        &mut self,
        clock: &mut K,
        capture: &mut C,
        format: &AudioFormat,
    ) -> Result<(), StartupError>
    where
        K: AudioClock,
        C: CaptureSource,
    {
        clock.apply_sample_rate_clock(format.sample_rate)?;
        capture.configure(format)?;

        self.bus.start();
        log::info!("Waiting for host to configure the device");

        let deadline = Instant::now() + self.enumeration_timeout;
        while !self.bus.is_configured() {
            if Instant::now() >= deadline {
                return Err(StartupError::EnumerationTimeout(self.enumeration_timeout));
            }
            thread::sleep(self.slice);
        }

        self.bus.start_streaming();
        self.active = true;
        log::info!("Device configured, streaming {}", format);
        Ok(())
    }

    /// 单步：处理一次挂起标志采样
    ///
    /// 只在状态变化时产生事件，重复的相同读数不做任何事
    pub fn poll(&mut self, suspended: bool) -> Option<SessionEvent> {
        match (self.active, suspended) {
            (true, true) => {
                self.bus.stop_streaming();
                self.shared.request_stop();
                self.active = false;
                let event = SessionEvent::Disconnected(Local::now());
                log::info!("Bus suspended, streaming stopped");
                Some(event)
            }
            (false, false) => {
                self.bus.start_streaming();
                self.active = true;
                let event = SessionEvent::Connected(Local::now());
                log::info!("Bus resumed, streaming restarted");
                Some(event)
            }
            _ => None,
        }
    }

    /// 轮询直到 `running` 被清除
    pub fn run<F>(&mut self, running: &AtomicBool, mut on_event: F)
    where
        F: FnMut(SessionEvent),
    {
        while running.load(Ordering::Acquire) {
            let suspended = self.suspended.load(Ordering::Acquire);
            if let Some(event) = self.poll(suspended) {
                on_event(event);
            }
            thread::sleep(self.slice);
        }
        log::debug!("Session supervisor finished");
    }
}

/// 低层周期 tick：把总线挂起状态镜像到共享标志
pub struct BusTick<B: UsbBus> {
    bus: Arc<B>,
    suspended: Arc<AtomicBool>,
}

impl<B: UsbBus> BusTick<B> {
    pub fn new(bus: Arc<B>, suspended: Arc<AtomicBool>) -> Self {
        Self { bus, suspended }
    }

    #[inline]
    pub fn tick(&self) {
        self.suspended
            .store(self.bus.is_suspended(), Ordering::Release);
    }
}

/// 启动 1ms 周期的 bus tick 线程
pub fn spawn_bus_tick<B: UsbBus + 'static>(
    tick: BusTick<B>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bus-tick".to_string())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                tick.tick();
                thread::sleep(Duration::from_millis(1));
            }
        })
}

/// 模拟总线
///
/// 主机侧通过 [`SimulatedBus::set_suspended`] 挂起/恢复设备
#[derive(Debug)]
pub struct SimulatedBus {
    attached: AtomicBool,
    configured: AtomicBool,
    suspended: AtomicBool,
    streaming: AtomicBool,
    auto_configure: bool,
    stream_starts: AtomicU64,
    stream_stops: AtomicU64,
}

impl SimulatedBus {
    /// 上线后立即被主机配置的总线
    pub fn new() -> Self {
        Self::with_auto_configure(true)
    }

    /// 主机从不完成配置的总线
    pub fn never_configured() -> Self {
        Self::with_auto_configure(false)
    }

    fn with_auto_configure(auto_configure: bool) -> Self {
        Self {
            attached: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            auto_configure,
            stream_starts: AtomicU64::new(0),
            stream_stops: AtomicU64::new(0),
        }
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn stream_starts(&self) -> u64 {
        self.stream_starts.load(Ordering::Relaxed)
    }

    pub fn stream_stops(&self) -> u64 {
        self.stream_stops.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBus for SimulatedBus {
    fn start(&self) {
        self.attached.store(true, Ordering::Release);
        if self.auto_configure {
            self.configured.store(true, Ordering::Release);
        }
    }

    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn start_streaming(&self) {
        self.stream_starts.fetch_add(1, Ordering::Relaxed);
        self.streaming.store(true, Ordering::Release);
    }

    fn stop_streaming(&self) {
        self.stream_stops.fetch_add(1, Ordering::Relaxed);
        self.streaming.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SimulatedPdm;
    use crate::clock::SimulatedClock;
    use crate::stream::RecordingState;

    struct Fixture {
        bus: Arc<SimulatedBus>,
        shared: Arc<SharedControlState>,
        suspended: Arc<AtomicBool>,
        supervisor: SessionSupervisor<SimulatedBus>,
    }

    fn fixture(bus: SimulatedBus) -> Fixture {
        let config = StreamConfig {
            supervisor_slice_ms: 1,
            enumeration_timeout_ms: 20,
            ..StreamConfig::default()
        };
        let bus = Arc::new(bus);
        let shared = Arc::new(SharedControlState::new());
        let suspended = Arc::new(AtomicBool::new(false));
        let supervisor = SessionSupervisor::new(
            Arc::clone(&bus),
            Arc::clone(&shared),
            Arc::clone(&suspended),
            &config,
        );
        Fixture {
            bus,
            shared,
            suspended,
            supervisor,
        }
    }

    #[test]
    fn test_startup_sequence() {
        let mut f = fixture(SimulatedBus::new());
        let mut clock = SimulatedClock::new();
        let (mut pdm, _feeder) = SimulatedPdm::new(64);

        f.supervisor
            .startup(&mut clock, &mut pdm, &AudioFormat::default())
            .unwrap();

        assert_eq!(clock.frequency_hz(), 22_579_200);
        assert_eq!(pdm.format(), Some(AudioFormat::default()));
        assert!(f.bus.is_attached());
        assert!(f.bus.is_streaming());
        assert!(f.supervisor.is_active());
    }

    #[test]
    fn test_startup_fails_on_clock() {
        let mut f = fixture(SimulatedBus::new());
        let mut clock = SimulatedClock::failing();
        let (mut pdm, _feeder) = SimulatedPdm::new(64);

        let err = f
            .supervisor
            .startup(&mut clock, &mut pdm, &AudioFormat::default())
            .unwrap_err();
        assert!(matches!(err, StartupError::Clock(_)));
        assert!(!f.bus.is_attached());
        assert!(pdm.format().is_none());
    }

    #[test]
    fn test_startup_fails_on_unsupported_format() {
        let mut f = fixture(SimulatedBus::new());
        let mut clock = SimulatedClock::new();
        let (mut pdm, _feeder) = SimulatedPdm::new(64);

        let err = f
            .supervisor
            .startup(&mut clock, &mut pdm, &AudioFormat::new(48_000, 2, 16))
            .unwrap_err();
        assert!(matches!(err, StartupError::Capture(_)));
        assert!(!f.bus.is_attached());
    }

    #[test]
    fn test_startup_enumeration_timeout() {
        let mut f = fixture(SimulatedBus::never_configured());
        let mut clock = SimulatedClock::new();
        let (mut pdm, _feeder) = SimulatedPdm::new(64);

        let err = f
            .supervisor
            .startup(&mut clock, &mut pdm, &AudioFormat::default())
            .unwrap_err();
        assert!(matches!(err, StartupError::EnumerationTimeout(_)));
        assert!(!f.bus.is_streaming());
    }

    #[test]
    fn test_suspend_resume_edges() {
        let mut f = fixture(SimulatedBus::new());
        f.bus.start();
        f.bus.start_streaming();
        assert!(f.supervisor.poll(false).unwrap().is_connected());
        // 重复相同读数不产生事件
        assert!(f.supervisor.poll(false).is_none());

        let event = f.supervisor.poll(true).unwrap();
        assert!(!event.is_connected());
        assert!(!f.bus.is_streaming());
        assert!(f.supervisor.poll(true).is_none());
        assert!(f.supervisor.poll(true).is_none());
        assert_eq!(f.bus.stream_stops(), 1);

        assert!(f.supervisor.poll(false).unwrap().is_connected());
        assert!(f.bus.is_streaming());
    }

    #[test]
    fn test_suspend_clears_recording() {
        let mut f = fixture(SimulatedBus::new());
        f.supervisor.poll(false);

        f.shared.request_start();
        let epoch = f.shared.stop_epoch();
        f.shared.take_start_request();
        f.shared.mark_recording(epoch);
        assert_eq!(f.shared.recording_state(), RecordingState::Recording);

        f.supervisor.poll(true);
        assert_eq!(f.shared.recording_state(), RecordingState::Idle);
    }

    #[test]
    fn test_bus_tick_mirrors_suspend() {
        let f = fixture(SimulatedBus::new());
        let tick = BusTick::new(Arc::clone(&f.bus), Arc::clone(&f.suspended));

        f.bus.set_suspended(true);
        assert!(!f.suspended.load(Ordering::Acquire));
        tick.tick();
        assert!(f.suspended.load(Ordering::Acquire));

        f.bus.set_suspended(false);
        tick.tick();
        assert!(!f.suspended.load(Ordering::Acquire));
    }

    #[test]
    fn test_run_stops_with_flag() {
        let mut f = fixture(SimulatedBus::new());
        let running = AtomicBool::new(false);
        let mut events = Vec::new();
        f.supervisor.run(&running, |e| events.push(e));
        assert!(events.is_empty());
    }

    #[test]
    fn test_event_display() {
        let event = SessionEvent::Disconnected(Local::now());
        assert!(event.to_string().ends_with("host disconnected"));
    }
}
