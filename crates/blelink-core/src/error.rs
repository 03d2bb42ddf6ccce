//! 错误类型
//!
//! `BleError` 是 Scanner / Controller / Connector 对外暴露的唯一错误类型。
//! 调用方应按 [`BleError::code`] 分支处理，而不是匹配消息文本。

/// 底层 BLE 绑定（btleplug 或测试替身）返回的错误
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("{0}")]
    Failed(String),

    #[error("btleplug error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("Scan timed out after {timeout_ms} ms")]
    ScanTimedOut {
        timeout_ms: u64,
        uuids: Vec<String>,
        names: Vec<String>,
    },

    #[error("Failed to subscribe to characteristic {characteristic_uuid}: {original_error}")]
    CharacteristicSubscribeFailed {
        characteristic_uuid: String,
        original_error: String,
    },

    #[error("Failed to disconnect from peripheral {local_name}: {original_error}")]
    DeviceDisconnectFailed {
        local_name: String,
        original_error: String,
    },

    #[error("Scan finished without a matching peripheral")]
    NoMatch {
        uuids: Vec<String>,
        names: Vec<String>,
    },

    #[error("No BLE controller, call connect_ble() first")]
    NotConnected,

    #[error(transparent)]
    Binding(#[from] BindingError),
}

impl BleError {
    /// 稳定的错误代码，用于程序化分支
    pub fn code(&self) -> &'static str {
        match self {
            BleError::ScanTimedOut { .. } => "SCAN_TIMED_OUT",
            BleError::CharacteristicSubscribeFailed { .. } => "CHARACTERISTIC_SUBSCRIBE_FAILED",
            BleError::DeviceDisconnectFailed { .. } => "DEVICE_DISCONNECT_FAILED",
            BleError::NoMatch { .. } => "NO_MATCH",
            BleError::NotConnected => "NOT_CONNECTED",
            BleError::Binding(_) => "BINDING_FAILED",
        }
    }

    /// 面向用户的可读消息
    ///
    /// 超时错误会列出本次扫描请求的全部 uuid / name（不区分已找到与未找到）。
    pub fn friendly_message(&self) -> String {
        match self {
            BleError::ScanTimedOut {
                timeout_ms,
                uuids,
                names,
            } => {
                let mut message = format!("Scan timed out after {timeout_ms} ms!");
                message.push_str(&target_lines(uuids, names));
                message
            }
            BleError::CharacteristicSubscribeFailed {
                characteristic_uuid,
                original_error,
            } => format!(
                "Failed to subscribe to peripheral characteristic: {characteristic_uuid}!\nOriginal error: {original_error}"
            ),
            BleError::DeviceDisconnectFailed {
                local_name,
                original_error,
            } => format!(
                "Failed to disconnect from peripheral: {local_name}!\nOriginal error: {original_error}"
            ),
            BleError::NoMatch { uuids, names } => {
                let mut message = "Scan finished without a matching peripheral!".to_string();
                message.push_str(&target_lines(uuids, names));
                message
            }
            BleError::NotConnected => {
                "Not connected to a BLE device yet, call connect_ble() first!".to_string()
            }
            BleError::Binding(err) => format!("Bluetooth operation failed: {err}"),
        }
    }
}

fn target_lines(uuids: &[String], names: &[String]) -> String {
    let mut lines = String::new();
    if !uuids.is_empty() {
        lines.push_str("\nFailed to discover all uuids: ");
        lines.push_str(&uuids.join(", "));
    }
    if !names.is_empty() {
        lines.push_str("\nFailed to discover all names: ");
        lines.push_str(&names.join(", "));
    }
    lines
}

pub type Result<T> = std::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_timed_out_friendly_message_lists_targets() {
        let err = BleError::ScanTimedOut {
            timeout_ms: 5000,
            uuids: vec!["aa".to_string(), "bb".to_string()],
            names: vec![],
        };

        let message = err.friendly_message();
        assert!(message.contains("5000 ms"));
        assert!(message.contains("Failed to discover all uuids: aa, bb"));
        assert!(!message.contains("names"));
        assert_eq!(err.code(), "SCAN_TIMED_OUT");
    }

    #[test]
    fn test_scan_timed_out_names_only() {
        let err = BleError::ScanTimedOut {
            timeout_ms: 10,
            uuids: vec![],
            names: vec!["Muse".to_string()],
        };

        let message = err.friendly_message();
        assert!(message.contains("Failed to discover all names: Muse"));
        assert!(!message.contains("uuids"));
    }

    #[test]
    fn test_binding_error_converts() {
        let err: BleError = BindingError::Failed("radio off".to_string()).into();
        assert_eq!(err.code(), "BINDING_FAILED");
        assert_eq!(err.to_string(), "radio off");
    }

    #[test]
    fn test_disconnect_failed_message() {
        let err = BleError::DeviceDisconnectFailed {
            local_name: "Headset".to_string(),
            original_error: "busy".to_string(),
        };
        assert!(err.friendly_message().contains("Headset"));
        assert!(err.friendly_message().contains("busy"));
        assert_eq!(err.code(), "DEVICE_DISCONNECT_FAILED");
    }
}
