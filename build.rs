use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    control: Control,
    playback: Playback,
    presence: Presence,
    defaults: Defaults,
    // 各 profile 结构由运行时的 serde 校验，这里只原样转成 JSON
    profiles: toml::Table,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Control {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Playback {
    device: String,
    period_size: usize,
}

#[derive(Deserialize)]
struct Presence {
    idle_activity: String,
    idle_url: String,
}

#[derive(Deserialize)]
struct Defaults {
    profile: String,
    name: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 控制桥配置
    println!("cargo:rustc-env=CONTROL_LOCAL_IP={}", config.control.local_ip);
    println!("cargo:rustc-env=CONTROL_LOCAL_PORT={}", config.control.local_port);
    println!("cargo:rustc-env=CONTROL_REMOTE_IP={}", config.control.remote_ip);
    println!("cargo:rustc-env=CONTROL_REMOTE_PORT={}", config.control.remote_port);
    println!("cargo:rustc-env=CONTROL_BUFFER_SIZE={}", config.control.buffer_size);

    // 播放配置
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.playback.device);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.playback.period_size);

    // 状态显示
    println!("cargo:rustc-env=PRESENCE_IDLE_ACTIVITY={}", config.presence.idle_activity);
    println!("cargo:rustc-env=PRESENCE_IDLE_URL={}", config.presence.idle_url);

    println!("cargo:rustc-env=DEFAULT_PROFILE={}", config.defaults.profile);
    println!("cargo:rustc-env=DEFAULT_NAME={}", config.defaults.name);

    // profiles 含数组，整体序列化为单行 JSON
    let profiles_json =
        serde_json::to_string(&config.profiles).expect("Failed to serialize profiles");
    println!("cargo:rustc-env=PROFILES_JSON={}", profiles_json);
}
