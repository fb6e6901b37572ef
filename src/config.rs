use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::session::readiness::{Marker, MarkerStage};

/// 解码后端类型
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// 单个解码进程，stdout/stderr 合并后用于就绪检测
    Decoder,
    /// 调谐进程 stdout 原始 PCM 经中继写入播放进程 stdin
    Relay,
}

/// Capture device the frame source reads once the decoder is ready.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
}

fn default_ready_description() -> String {
    "ready marker".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProfileConfig {
    pub backend: Backend,
    pub label: String,
    #[serde(default)]
    pub presence_url: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// argv 模板，`{name}` 会被替换为请求的配置名
    pub decoder_argv: Vec<String>,
    #[serde(default)]
    pub player_argv: Vec<String>,
    #[serde(default = "default_ready_description")]
    pub ready_description: String,
    pub markers: Vec<Marker>,
    /// 就绪标记出现后额外等待的时间（毫秒）
    #[serde(default)]
    pub settle_ms: u64,
    /// 0 表示无限等待
    #[serde(default)]
    pub ready_timeout_ms: u64,
    pub capture: CaptureConfig,
}

impl ProfileConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.decoder_argv.is_empty() {
            bail!("profile '{}': decoder_argv is empty", name);
        }
        if self.backend == Backend::Relay && self.player_argv.is_empty() {
            bail!("profile '{}': relay backend needs player_argv", name);
        }
        if !self.markers.iter().any(|m| m.stage == MarkerStage::Ready) {
            bail!("profile '{}': no ready marker configured", name);
        }
        if self.capture.sample_rate == 0 || self.capture.channels == 0 {
            bail!("profile '{}': invalid capture parameters", name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 控制桥配置
    pub control_local_ip: &'static str,
    pub control_local_port: u16,
    pub control_remote_ip: &'static str,
    pub control_remote_port: u16,
    pub control_buffer_size: usize,

    // 本地播放配置
    pub playback_device: &'static str,
    pub playback_period_size: usize,

    // 空闲时的状态显示
    pub presence_idle_activity: &'static str,
    pub presence_idle_url: &'static str,

    pub default_profile: &'static str,
    pub default_name: &'static str,

    pub profiles: HashMap<String, ProfileConfig>,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        let config = Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            control_local_ip: env!("CONTROL_LOCAL_IP"),
            control_local_port: env!("CONTROL_LOCAL_PORT")
                .parse()
                .context("Failed to parse CONTROL_LOCAL_PORT")?,
            control_remote_ip: env!("CONTROL_REMOTE_IP"),
            control_remote_port: env!("CONTROL_REMOTE_PORT")
                .parse()
                .context("Failed to parse CONTROL_REMOTE_PORT")?,
            control_buffer_size: env!("CONTROL_BUFFER_SIZE")
                .parse()
                .context("Failed to parse CONTROL_BUFFER_SIZE")?,

            playback_device: env!("PLAYBACK_DEVICE"),
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE")
                .parse()
                .context("Failed to parse PLAYBACK_PERIOD_SIZE")?,

            presence_idle_activity: env!("PRESENCE_IDLE_ACTIVITY"),
            presence_idle_url: env!("PRESENCE_IDLE_URL"),

            default_profile: env!("DEFAULT_PROFILE"),
            default_name: env!("DEFAULT_NAME"),

            profiles: parse_profiles(env!("PROFILES_JSON"))?,
        };

        if !config.profiles.contains_key(config.default_profile) {
            bail!("default profile '{}' is not configured", config.default_profile);
        }
        Ok(config)
    }
}

pub fn parse_profiles(json: &str) -> Result<HashMap<String, ProfileConfig>> {
    let profiles: HashMap<String, ProfileConfig> =
        serde_json::from_str(json).context("Failed to parse PROFILES_JSON")?;
    for (name, profile) in &profiles {
        profile.validate(name)?;
    }
    Ok(profiles)
}
