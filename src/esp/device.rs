use core::fmt::Write;
use esp_hal::efuse::Efuse;
use esp_hal::rtc_cntl::SocResetReason;

/// Factory MAC address from efuse.
pub fn mac_address() -> [u8; 6] {
    Efuse::mac_address()
}

/// MAC address without separators, lowercase. Used as MQTT client id suffix
/// when the configured module name is empty.
pub fn device_id() -> heapless::String<12> {
    let mac = mac_address();
    let mut s = heapless::String::<12>::new();
    for byte in mac {
        let _ = write!(s, "{:02x}", byte);
    }
    s
}

/// Identity logged at boot.
#[derive(Clone)]
pub struct DeviceInfo {
    pub device_id: heapless::String<12>,
    pub reset_reason: &'static str,
}

impl DeviceInfo {
    pub fn get() -> Self {
        Self {
            device_id: device_id(),
            reset_reason: reset_reason_name(esp_hal::system::reset_reason()),
        }
    }
}

pub fn reset_reason_name(reset_reason: Option<SocResetReason>) -> &'static str {
    match reset_reason {
        Some(SocResetReason::ChipPowerOn) => "ChipPowerOn",
        Some(SocResetReason::CoreSw) => "CoreSw",
        Some(SocResetReason::Cpu0Sw) => "Cpu0Sw",
        Some(SocResetReason::SysBrownOut) => "SysBrownOut",
        Some(SocResetReason::CoreMwdt0 | SocResetReason::CoreMwdt1) => "CoreMwdt",
        Some(SocResetReason::Cpu0Mwdt0 | SocResetReason::Cpu0Mwdt1) => "Cpu0Mwdt",
        Some(
            SocResetReason::CoreRtcWdt
            | SocResetReason::SysRtcWdt
            | SocResetReason::Cpu0RtcWdt
            | SocResetReason::SysSuperWdt,
        ) => "RtcWdt",
        Some(SocResetReason::CoreDeepSleep) => "CoreDeepSleep",
        Some(_) => "Other",
        None => "None",
    }
}
