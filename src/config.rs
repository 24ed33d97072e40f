use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// 服务启动后是否自动开始推流
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_auto_start_delay_ms")]
    pub auto_start_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            destination: DestinationConfig::default(),
            source: SourceConfig::default(),
            encoding: EncodingConfig::default(),
            encoder: EncoderConfig::default(),
            supervisor: SupervisorConfig::default(),
            auto_start: false,
            auto_start_delay_ms: default_auto_start_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 健康检查周期 (只记录日志，不触发重启)
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

/// RTMP 推流目标
#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_url")]
    pub url: String,
    /// 推流密钥，为空时禁止推流
    #[serde(default)]
    pub key: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            url: default_destination_url(),
            key: String::new(),
        }
    }
}

/// 视频源：合成测试图案或本地文件
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Pattern {
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_tone_hz")]
        tone_hz: u32,
    },
    File {
        path: String,
        /// 直接复制码流，不重新编码
        #[serde(default = "default_true")]
        copy_codecs: bool,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Pattern {
            pattern: default_pattern(),
            tone_hz: default_tone_hz(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EncodingConfig {
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub gop: u32,
    pub preset: String,
    pub pixel_format: String,
    pub audio_sample_rate: u32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            width: 1280,
            height: 720,
            fps: 30,
            gop: 60,
            preset: "veryfast".to_string(),
            pixel_format: "yuv420p".to_string(),
            audio_sample_rate: 44100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// 额外传给编码进程的环境变量
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            env: HashMap::new(),
        }
    }
}

/// 进程守护与故障重启策略
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 自动重启次数上限，达到后停在 Failed 状态直到人工干预
    pub max_restart_attempts: u32,
    /// 两次自动重启之间的最短间隔 (毫秒)
    pub restart_cooldown_ms: u64,
    /// 等待编码器首行输出的超时 (毫秒)
    pub startup_timeout_ms: u64,
    /// restart 时 stop 与 start 之间的等待 (毫秒)
    pub settle_delay_ms: u64,
    /// 意外退出后到自动重启的延迟 (毫秒)
    pub restart_delay_ms: u64,
    /// SIGTERM 后等待退出的宽限期，超时则强杀 (毫秒)
    pub termination_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 5,
            restart_cooldown_ms: 60_000,
            startup_timeout_ms: 10_000,
            settle_delay_ms: 2_000,
            restart_delay_ms: 5_000,
            termination_grace_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_destination_url() -> String {
    "rtmp://a.rtmp.youtube.com/live2".to_string()
}

fn default_pattern() -> String {
    "testsrc2".to_string()
}

fn default_tone_hz() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_auto_start_delay_ms() -> u64 {
    5_000
}

impl AppConfig {
    /// 加载配置：文件不存在时使用默认值，随后叠加环境变量
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            info!("Config file {:?} not found, using defaults", path);
            AppConfig::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// 用环境变量覆盖配置项，`lookup` 便于测试注入
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.listen = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(url) = lookup("YOUTUBE_STREAM_URL") {
            self.destination.url = url.trim().to_string();
        }
        if let Some(key) = lookup("YOUTUBE_STREAM_KEY") {
            self.destination.key = key.trim().to_string();
        }
        if let Some(flag) = lookup("AUTO_START_STREAM") {
            self.auto_start = flag.trim() == "true";
        }
        if let Some(binary) = lookup("FFMPEG_PATH") {
            self.encoder.binary = binary;
        }
        if let Some(raw) = lookup("MAX_RESTART_ATTEMPTS") {
            match raw.trim().parse() {
                Ok(n) => self.supervisor.max_restart_attempts = n,
                Err(e) => warn!("Ignoring MAX_RESTART_ATTEMPTS={:?}: {}", raw, e),
            }
        }
        if let Some(raw) = lookup("RESTART_COOLDOWN_MS") {
            match raw.trim().parse() {
                Ok(ms) => self.supervisor.restart_cooldown_ms = ms,
                Err(e) => warn!("Ignoring RESTART_COOLDOWN_MS={:?}: {}", raw, e),
            }
        }
    }
}
