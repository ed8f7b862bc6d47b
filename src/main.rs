//! mic-stream - PDM 麦克风推流模拟器
//!
//! 在一个进程里跑完整条链路：
//! - 模拟 PDM 抽取器线程按采样率（带抖动）填充硬件 FIFO
//! - 传输线程每个服务周期调用一次 streaming arbiter
//! - 主线程扮演主机：按脚本发送开始/静音/挂起/停止
//! - session supervisor 处理挂起与恢复

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use mic_stream::audio::format::SUPPORTED_FORMATS;
use mic_stream::audio::{PacketGeometry, StreamStats};
use mic_stream::capture::{spawn_feeder, FeederConfig, SimulatedPdm};
use mic_stream::clock::SimulatedClock;
use mic_stream::control::{alt_setting_for, ControlEvent, ControlRequest, ControlSelector, ControlSurface};
use mic_stream::session::{spawn_bus_tick, BusTick, SessionSupervisor, SimulatedBus};
use mic_stream::stream::{FrameSource, Packet, StreamingArbiter};
use mic_stream::StreamConfig;

/// mic-stream - Real-time PDM microphone streaming simulator
#[derive(Parser)]
#[command(name = "mic-stream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Sample rate in Hz (16000, 22050, 32000, 44100)
    #[arg(short, long, default_value = "44100")]
    rate: u32,

    /// Run time in seconds
    #[arg(short, long, default_value = "3")]
    seconds: f64,

    /// Simulated clock drift: ±N words per millisecond
    #[arg(short, long, default_value = "2")]
    jitter: usize,

    /// Host mutes the microphone at this time (seconds)
    #[arg(long)]
    mute_at: Option<f64>,

    /// Host stops recording at this time (seconds)
    #[arg(long)]
    stop_at: Option<f64>,

    /// Host suspends the bus at this time (seconds), resumes shortly after
    #[arg(long)]
    suspend_at: Option<f64>,

    /// Do not lock sample buffers in memory
    #[arg(long)]
    no_mlock: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show supported formats and packet sizes
    Info,
}

/// 挂起持续时间
const SUSPEND_DURATION: Duration = Duration::from_millis(300);

/// 恢复后主机重新开始录音前的延迟
const RESTART_DELAY: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Some(Commands::Info) => show_format_info(),
        None => run_session(&cli),
    }
}

/// 显示格式表
fn show_format_info() -> anyhow::Result<()> {
    let config = StreamConfig::default();
    println!("=== Supported Formats ===\n");

    for (index, format) in SUPPORTED_FORMATS.iter().enumerate() {
        let geometry = PacketGeometry::for_format(format, config.interval_ms);
        let default_mark = if index == config.format_index { " *" } else { "" };
        let alt = alt_setting_for(index)
            .map(|alt| format!("alt {}", alt))
            .unwrap_or_else(|| "power-on".to_string());
        println!(
            "[{:<8}] {:<20} packet {} B nominal / {} B max, clock {} Hz{}",
            alt,
            format.to_string(),
            geometry.nominal_bytes(),
            geometry.capacity_bytes(),
            format.audio_clock_hz(),
            default_mark
        );
    }

    println!();
    println!("* = power-on default");
    println!("Service interval: {} ms", config.interval_ms);
    Ok(())
}

/// 主机侧收到的数据
#[derive(Debug, Default)]
struct HostSink {
    packets: u64,
    bytes: u64,
    silent_packets: u64,
    /// 连续两个周期收到同一块缓冲区的次数，应为 0
    reused_buffers: u64,
    last_source: Option<FrameSource>,
}

impl HostSink {
    fn consume(&mut self, packet: &Packet<'_>) {
        self.packets += 1;
        self.bytes += packet.len() as u64;
        if packet.is_silent() {
            self.silent_packets += 1;
        }

        let source = packet.source();
        if matches!(source, FrameSource::Buffer(_)) && self.last_source == Some(source) {
            self.reused_buffers += 1;
        }
        self.last_source = Some(source);
    }
}

/// 运行一次完整会话
fn run_session(cli: &Cli) -> anyhow::Result<()> {
    let format_index = SUPPORTED_FORMATS
        .iter()
        .position(|f| f.sample_rate == cli.rate)
        .with_context(|| format!("unsupported sample rate {} Hz", cli.rate))?;

    let config = StreamConfig {
        format_index,
        jitter_words: cli.jitter,
        lock_memory: !cli.no_mlock,
        ..StreamConfig::default()
    };
    let format = SUPPORTED_FORMATS[config.format_index];
    let timeline = Timeline::from_cli(cli)?;

    println!("mic-stream - Streaming {}", format);
    println!("Press Ctrl+C to stop.\n");

    // 设置 Ctrl+C 处理
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let shared = Arc::new(mic_stream::stream::SharedControlState::with_format_index(
        config.format_index,
    ));
    let bus = Arc::new(SimulatedBus::new());
    let suspended = Arc::new(AtomicBool::new(false));
    let (mut pdm, feeder) = SimulatedPdm::new(config.fifo_depth);
    let counters = pdm.counters();

    // 一次性启动：失败即退出
    let mut clock = SimulatedClock::new();
    let mut supervisor = SessionSupervisor::new(
        Arc::clone(&bus),
        Arc::clone(&shared),
        Arc::clone(&suspended),
        &config,
    );
    supervisor
        .startup(&mut clock, &mut pdm, &format)
        .context("device startup failed")?;

    let mut arbiter = StreamingArbiter::new(pdm, Arc::clone(&shared), config.interval_ms);
    if config.lock_memory && !arbiter.lock_memory() {
        log::warn!("Continuing with unlocked sample buffers");
    }
    let stats = arbiter.stats();

    let feeder_thread = spawn_feeder(
        feeder,
        FeederConfig {
            format,
            jitter_words: config.jitter_words,
        },
        Arc::clone(&running),
    )
    .context("failed to spawn feeder thread")?;

    let bus_tick_thread = spawn_bus_tick(
        BusTick::new(Arc::clone(&bus), Arc::clone(&suspended)),
        Arc::clone(&running),
    )
    .context("failed to spawn bus tick thread")?;

    // 传输线程：总线推流期间每个服务周期取一个包
    let transport_thread = {
        let running = Arc::clone(&running);
        let bus = Arc::clone(&bus);
        let interval = Duration::from_millis(config.interval_ms as u64);
        thread::Builder::new()
            .name("iso-transport".to_string())
            .spawn(move || {
                let mut sink = HostSink::default();
                let mut next = Instant::now();
                while running.load(Ordering::Acquire) {
                    if bus.is_streaming() {
                        let packet = arbiter.tick();
                        sink.consume(&packet);
                    }
                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // 落后太多时不追赶
                        next = now;
                    }
                }
                sink
            })
            .expect("Failed to spawn transport thread")
    };

    let supervisor_thread = {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("session".to_string())
            .spawn(move || {
                supervisor.run(&running, |event| println!("{}", event));
            })
            .expect("Failed to spawn session thread")
    };

    run_host_script(&timeline, &config, &shared, &bus, &running);

    running.store(false, Ordering::SeqCst);
    let sink = transport_thread
        .join()
        .map_err(|_| anyhow::anyhow!("transport thread panicked"))?;
    for handle in [feeder_thread, bus_tick_thread, supervisor_thread] {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
    }

    print_summary(&stats, &sink, format.bytes_per_sample());
    println!(
        "Capture: {} starts, {} stops, {} overflow words",
        counters.starts(),
        counters.stops(),
        counters.overflow_words()
    );

    if sink.reused_buffers > 0 {
        anyhow::bail!(
            "double buffer exclusivity violated {} times",
            sink.reused_buffers
        );
    }
    Ok(())
}

/// 主机脚本：开始录音，之后按命令行时间点静音/挂起/停止
fn run_host_script(
    timeline: &Timeline,
    config: &StreamConfig,
    shared: &Arc<mic_stream::stream::SharedControlState>,
    bus: &Arc<SimulatedBus>,
    running: &AtomicBool,
) {
    let control = ControlSurface::new(Arc::clone(shared), config.feature_unit_id);
    let unit = config.feature_unit_id;

    let send = |request: ControlRequest, payload: &mut [u8]| {
        if let Err(e) = control.handle(&request, payload) {
            log::warn!("Host request stalled: {}", e);
        }
    };

    // 主机选择 alt setting 并下发采样率，然后开始录音；
    // 表中最后一项没有可选的 alt setting，只能作为上电默认值
    match alt_setting_for(config.format_index) {
        Some(alt) => {
            let rate = SUPPORTED_FORMATS[config.format_index].sample_rate.to_le_bytes();
            send(
                ControlRequest::control(ControlEvent::SetCur, unit, ControlSelector::SamplingFreq)
                    .with_alt_setting(alt),
                &mut [rate[0], rate[1], rate[2]],
            );
        }
        None => log::info!("Using power-on format, no sample rate request sent"),
    }
    send(ControlRequest::event(ControlEvent::RecordStart), &mut []);

    let start = Instant::now();
    let deadline = timeline.deadline;
    let mut mute_at = timeline.mute_at;
    let mut stop_at = timeline.stop_at;
    let mut suspend_at = timeline.suspend_at;
    let mut resume_at: Option<Duration> = None;
    let mut restart_at: Option<Duration> = None;

    while running.load(Ordering::SeqCst) {
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            break;
        }

        if due(&mut mute_at, elapsed) {
            println!("[host] mute");
            send(
                ControlRequest::control(ControlEvent::SetCur, unit, ControlSelector::Mute),
                &mut [1],
            );
        }
        if due(&mut suspend_at, elapsed) {
            // 挂起前不发送停止录音，由 supervisor 兜底
            println!("[host] suspend");
            bus.set_suspended(true);
            resume_at = Some(elapsed + SUSPEND_DURATION);
        }
        if due(&mut resume_at, elapsed) {
            println!("[host] resume");
            bus.set_suspended(false);
            restart_at = Some(elapsed + RESTART_DELAY);
        }
        if due(&mut restart_at, elapsed) {
            println!("[host] record start");
            send(ControlRequest::event(ControlEvent::RecordStart), &mut []);
        }
        if due(&mut stop_at, elapsed) {
            println!("[host] record stop");
            send(ControlRequest::event(ControlEvent::RecordStop), &mut []);
        }

        thread::sleep(Duration::from_millis(10));
    }
}

/// 主机脚本的时间点
#[derive(Debug)]
struct Timeline {
    deadline: Duration,
    mute_at: Option<Duration>,
    stop_at: Option<Duration>,
    suspend_at: Option<Duration>,
}

impl Timeline {
    fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let optional = |value: Option<f64>, name: &str| value.map(|v| seconds(v, name)).transpose();
        Ok(Self {
            deadline: seconds(cli.seconds, "--seconds")?,
            mute_at: optional(cli.mute_at, "--mute-at")?,
            stop_at: optional(cli.stop_at, "--stop-at")?,
            suspend_at: optional(cli.suspend_at, "--suspend-at")?,
        })
    }
}

fn seconds(value: f64, name: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("invalid {} value {}", name, value))
}

/// 到达时间点时返回 true，并清除该时间点
fn due(at: &mut Option<Duration>, elapsed: Duration) -> bool {
    match *at {
        Some(t) if elapsed >= t => {
            *at = None;
            true
        }
        _ => false,
    }
}

fn print_summary(stats: &StreamStats, sink: &HostSink, bytes_per_word: usize) {
    println!("\n{}", stats.report(bytes_per_word));
    println!(
        "Host received {} packets ({} bytes), {} silent",
        sink.packets, sink.bytes, sink.silent_packets
    );
}
