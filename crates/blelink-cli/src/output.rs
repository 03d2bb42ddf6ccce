//! 终端输出格式

use std::fmt::Write as _;

use blelink_core::{BleController, BlePeripheral};
use serde::Serialize;

/// 扫描结果的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralSummary {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
}

impl PeripheralSummary {
    pub fn from_peripheral(peripheral: &dyn BlePeripheral) -> Self {
        Self {
            uuid: peripheral.uuid(),
            local_name: peripheral.local_name(),
        }
    }

    pub fn from_controller(controller: &BleController) -> Self {
        Self {
            uuid: controller.uuid(),
            local_name: controller.name(),
        }
    }

    pub fn line(&self, index: usize) -> String {
        format!(
            "   [{index}] {} ({})",
            self.local_name.as_deref().unwrap_or("<unnamed>"),
            self.uuid
        )
    }
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
