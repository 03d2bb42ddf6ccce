//! 配置和持久化
//!
//! 扫描超时、目标设备等设置保存在 `<config_dir>/blelink/settings.toml`。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ble::scanner::{DEFAULT_DURATION_MS, DEFAULT_TIMEOUT_MS, ScannerOptions};
use crate::logging::LogLevel;

/// 持久化设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// 有界扫描的默认超时
    pub default_timeout_ms: u64,
    /// `scan_all` 的默认时长
    pub default_duration_ms: u64,
    /// RSSI 轮询间隔，缺省不轮询
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_local_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<String>,
    pub log_level: LogLevel,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_duration_ms: DEFAULT_DURATION_MS,
            rssi_interval_ms: None,
            device_local_name: None,
            device_uuid: None,
            log_level: LogLevel::default(),
        }
    }
}

impl BleSettings {
    /// 配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blelink")
            .join("settings.toml")
    }

    /// 加载设置（文件不存在或无法解析时使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {}", path.display());
                    return settings;
                }
                Err(e) => warn!("Failed to parse settings: {e}, using defaults"),
            },
            Err(e) => warn!("Failed to read settings file: {e}, using defaults"),
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    pub fn scanner_options(&self) -> ScannerOptions {
        ScannerOptions {
            default_timeout_ms: Some(self.default_timeout_ms),
            default_duration_ms: Some(self.default_duration_ms),
        }
    }
}
