//! Blelink CLI
//!
//! 扫描、查找并保持连接 BLE 外设

mod output;

use std::sync::Arc;

use anyhow::{Result, bail};
use blelink_core::{
    BleCharacteristic, BleConnector, BleError, BleScanner, BleSettings, BtleplugDiscovery,
    CharacteristicCallbacks, ConnectorOptions, DiscoverySource, LogLevel, ScanOptions, Scanner,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use output::{PeripheralSummary, to_hex};

#[derive(Parser)]
#[command(name = "blelink", version, about = "BLE 外设扫描与连接工具")]
struct Cli {
    /// 日志级别 (error, warn, info, debug, trace)，RUST_LOG 优先
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的所有外设
    Scan {
        /// 扫描时长 (毫秒)
        #[arg(short, long)]
        duration_ms: Option<u64>,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 查找指定外设，全部找到或超时后返回
    Find {
        /// 外设 uuid，可重复
        #[arg(long, conflicts_with = "name")]
        uuid: Vec<String>,
        /// 名称子串，可重复
        #[arg(long)]
        name: Vec<String>,
        /// 超时时间 (毫秒)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// 连接并保持，直到 Ctrl-C
    Connect {
        #[arg(long)]
        uuid: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// RSSI 轮询间隔 (毫秒)
        #[arg(long)]
        rssi_interval_ms: Option<u64>,
        /// 打印这些特征的通知数据，可重复 (完整 uuid 或 16/32 位短 uuid，如 2a37)
        #[arg(long)]
        notify: Vec<String>,
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// 查看当前配置
    Config {
        /// 写入配置文件
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = BleSettings::load();
    init_logging(cli.log_level.unwrap_or(settings.log_level));

    match cli.command {
        Commands::Scan { duration_ms, json } => scan(&settings, duration_ms, json).await?,
        Commands::Find {
            uuid,
            name,
            timeout_ms,
        } => find(&settings, uuid, name, timeout_ms).await?,
        Commands::Connect {
            uuid,
            name,
            rssi_interval_ms,
            notify,
            timeout_ms,
        } => {
            let scan_options = ScanOptions {
                characteristic_callbacks: print_callbacks(&notify),
                rssi_interval_ms: rssi_interval_ms.or(settings.rssi_interval_ms),
                timeout_ms,
            };
            connect(&settings, uuid, name, scan_options).await?;
        }
        Commands::Config { save } => config(&settings, save)?,
    }

    Ok(())
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（blelink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .try_init();
}

async fn open_source() -> Result<Arc<dyn DiscoverySource>> {
    Ok(Arc::new(BtleplugDiscovery::new().await?))
}

/// 把库错误转成带友好消息的 anyhow 错误
fn friendly(err: BleError) -> anyhow::Error {
    anyhow::anyhow!(err.friendly_message())
}

async fn scan(settings: &BleSettings, duration_ms: Option<u64>, json: bool) -> Result<()> {
    let scanner = BleScanner::new(open_source().await?, settings.scanner_options());
    let duration_ms = duration_ms.unwrap_or(settings.default_duration_ms);

    if !json {
        println!("🔍 扫描设备 ({duration_ms} ms)...");
    }
    let peripherals = scanner.scan_all(Some(duration_ms)).await.map_err(friendly)?;
    let summaries: Vec<PeripheralSummary> = peripherals
        .iter()
        .map(|p| PeripheralSummary::from_peripheral(p.as_ref()))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else if summaries.is_empty() {
        println!("   未发现设备");
    } else {
        for (i, summary) in summaries.iter().enumerate() {
            println!("{}", summary.line(i));
        }
    }
    Ok(())
}

async fn find(
    settings: &BleSettings,
    mut uuids: Vec<String>,
    mut names: Vec<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    if uuids.is_empty() && names.is_empty() {
        match (&settings.device_uuid, &settings.device_local_name) {
            (Some(uuid), _) => uuids.push(uuid.clone()),
            (None, Some(name)) => names.push(name.clone()),
            (None, None) => bail!("Specify --uuid or --name"),
        }
    }

    let scanner = BleScanner::new(open_source().await?, settings.scanner_options());
    let options = ScanOptions {
        timeout_ms,
        ..ScanOptions::default()
    };
    let controllers = if uuids.is_empty() {
        scanner.scan_for_names(names, options).await
    } else {
        scanner.scan_for_uuids(uuids, options).await
    }
    .map_err(friendly)?;

    println!("✅ 找到 {} 个设备", controllers.len());
    for (i, controller) in controllers.iter().enumerate() {
        let summary = PeripheralSummary::from_controller(controller);
        println!("{}", summary.line(i));
        for service in controller.services() {
            println!("       service {}", service.uuid);
            for characteristic in &service.characteristic_uuids {
                println!("         - {characteristic}");
            }
        }
    }

    for controller in &controllers {
        controller.disconnect().await.map_err(friendly)?;
    }
    Ok(())
}

/// Bluetooth 基础 uuid: 0000xxxx-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// 16/32 位短 uuid 展开为完整形式，其余输入只转小写
fn expand_uuid(uuid: &str) -> String {
    match u32::from_str_radix(uuid, 16) {
        Ok(short) if matches!(uuid.len(), 4 | 8) => {
            Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96)).to_string()
        }
        _ => uuid.to_lowercase(),
    }
}

fn print_callbacks(uuids: &[String]) -> CharacteristicCallbacks {
    uuids
        .iter()
        .map(|uuid| {
            let callback: blelink_core::CharacteristicCallback =
                Arc::new(|data: &[u8], characteristic: &Arc<dyn BleCharacteristic>| {
                    println!("📥 {}: {}", characteristic.uuid(), to_hex(data));
                });
            (expand_uuid(uuid), callback)
        })
        .collect()
}

async fn connect(
    settings: &BleSettings,
    uuid: Option<String>,
    name: Option<String>,
    scan_options: ScanOptions,
) -> Result<()> {
    let device_uuid = uuid.or_else(|| settings.device_uuid.clone());
    let device_local_name = name
        .or_else(|| settings.device_local_name.clone())
        .unwrap_or_default();
    if device_uuid.is_none() && device_local_name.is_empty() {
        bail!("Specify --uuid or --name");
    }

    let options = ConnectorOptions::new(device_local_name)
        .with_device_uuid(device_uuid)
        .with_scanner_options(settings.scanner_options())
        .with_scan_options(scan_options);
    let connector = BleConnector::create(open_source().await?, options)
        .await
        .map_err(friendly)?;
    let controller = connector.connect_ble().await.map_err(friendly)?;

    let summary = PeripheralSummary::from_controller(&controller);
    println!("🔗 已连接: {}", summary.line(0).trim_start());
    println!("   按 Ctrl-C 断开");

    let mut failures = controller.reconnect_failures();
    let watcher = tokio::spawn(async move {
        while let Ok(err) = failures.recv().await {
            tracing::error!("{}", err.friendly_message());
        }
    });

    tokio::signal::ctrl_c().await?;
    watcher.abort();

    println!("⏹️  断开连接");
    connector.disconnect_ble().await.map_err(friendly)?;
    Ok(())
}

fn config(settings: &BleSettings, save: bool) -> Result<()> {
    println!("# {}", BleSettings::config_path().display());
    print!("{}", toml::to_string_pretty(settings)?);

    if save {
        let path = settings.save()?;
        println!("✅ 已保存到 {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_connect() {
        let cli = Cli::try_parse_from([
            "blelink",
            "connect",
            "--name",
            "Headset",
            "--notify",
            "2A37",
            "--notify",
            "2a38",
            "--rssi-interval-ms",
            "500",
        ])
        .unwrap();

        match cli.command {
            Commands::Connect {
                name,
                notify,
                rssi_interval_ms,
                uuid,
                ..
            } => {
                assert_eq!(name.as_deref(), Some("Headset"));
                assert_eq!(notify, vec!["2A37", "2a38"]);
                assert_eq!(rssi_interval_ms, Some(500));
                assert!(uuid.is_none());
            }
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn test_cli_find_uuid_conflicts_with_name() {
        let result = Cli::try_parse_from(["blelink", "find", "--uuid", "a", "--name", "b"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_global_log_level() {
        let cli = Cli::try_parse_from(["blelink", "scan", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
    }

    #[test]
    fn test_expand_uuid() {
        assert_eq!(expand_uuid("2A37"), "00002a37-0000-1000-8000-00805f9b34fb");
        assert_eq!(expand_uuid("0000fff0"), "0000fff0-0000-1000-8000-00805f9b34fb");
        assert_eq!(
            expand_uuid("6E400003-B5A3-F393-E0A9-E50E24DCCA9E"),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(expand_uuid("zz12"), "zz12");
    }

    #[test]
    fn test_print_callbacks_keys_match_btleplug_uuids() {
        let callbacks = print_callbacks(&[
            "2A37".to_string(),
            "00002A38-0000-1000-8000-00805F9B34FB".to_string(),
        ]);
        assert!(callbacks.contains_key("00002a37-0000-1000-8000-00805f9b34fb"));
        assert!(callbacks.contains_key("00002a38-0000-1000-8000-00805f9b34fb"));
    }
}
