//! Device/Config Facade (§4.A). Pure getters over device identity, the
//! current image, and remote config; URL selection and query-body building.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::collaborators::{SharedDevicePropertyStore, SharedRemoteConfigStore};
use crate::error::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    Unknown,
    Dev,
    Vbn,
    Qa,
    Prod,
}

impl BuildType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "dev" => BuildType::Dev,
            "vbn" => BuildType::Vbn,
            "qa" => BuildType::Qa,
            "prod" => BuildType::Prod,
            _ => BuildType::Unknown,
        }
    }

    pub fn is_non_production(self) -> bool {
        !matches!(self, BuildType::Prod)
    }
}

/// Device Identity (§3): populated once at start-up, immutable thereafter.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub model: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub estb_mac: String,
    pub build_type: BuildType,
    pub image_download_path: PathBuf,
    pub persistent_path: PathBuf,
    pub capabilities: String,
    pub partner_id: String,
    pub experience: String,
    pub maintenance_mode: bool,
    pub software_optout: bool,
}

/// Current Image (§3): read from a version file at start-up.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub running_image_name: String,
}

/// Remote Config (§3): refreshed on demand, never written by the core.
#[derive(Debug, Clone)]
pub struct RfcSettings {
    pub throttle_enabled: bool,
    pub top_speed: u64,
    pub incremental_cdl: bool,
    pub mtls_enabled: bool,
    pub debug_services: bool,
    pub manage_notify: bool,
    pub auto_excluded: bool,
}

/// Remote-config key names consulted by [`ConfigFacade`]. Kept as constants
/// so the key set is introspectable and greppable from one place (§9).
mod rfc_keys {
    pub const RECOVERY_URL: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_Xconf.RecoveryURL";
    pub const AUTO_EXCLUDE_URL: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_Xconf.AutoExcludeURL";
    pub const BOOTSTRAP_URL: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_Xconf.BootstrapURL";
    pub const DEV_XCONF_URL: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_Xconf.DevURL";
    pub const XCONF_HOST: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_Xconf.Host";
    pub const THROTTLE_ENABLED: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.FirmwareThrottle.Enable";
    pub const TOP_SPEED: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.FirmwareThrottle.TopSpeed";
    pub const INCREMENTAL_CDL: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.IncrementalCDL.Enable";
    pub const MTLS_ENABLED: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.MTLS.Enable";
    pub const DEBUG_SERVICES: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.DebugServices.Enable";
    pub const MANAGE_NOTIFY: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.ManageNotify.Enable";
    pub const AUTO_EXCLUDED: &str = "tr181.Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.AutoExclude.Enable";
}

const DEFAULT_XCONF_HOST: &str = "xconf.example.com";
const LOCAL_OVERRIDE_FILE: &str = "/opt/swupdate.conf";

pub struct ConfigFacade {
    device: DeviceInfo,
    image: ImageDetails,
    properties: SharedDevicePropertyStore,
    rfc: SharedRemoteConfigStore,
    /// state-red recovery posture (§9: a small typed flag read by this
    /// facade, the orchestrator, and the upgrade pipeline; never flipped
    /// from within a callback).
    state_red: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl ConfigFacade {
    pub fn new(
        device: DeviceInfo,
        image: ImageDetails,
        properties: SharedDevicePropertyStore,
        rfc: SharedRemoteConfigStore,
        state_red: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            device,
            image,
            properties,
            rfc,
            state_red,
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn image(&self) -> &ImageDetails {
        &self.image
    }

    pub fn is_state_red(&self) -> bool {
        self.state_red.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// A raw device-property lookup, for callers (e.g. the upgrade pipeline's
    /// peripheral version check) that need a key this facade doesn't expose
    /// as a typed getter.
    pub fn device_property(&self, key: &str) -> Option<String> {
        self.properties.get(key)
    }

    pub fn rfc(&self) -> RfcSettings {
        let get_bool = |key: &str| {
            self.rfc
                .get(key)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false)
        };
        RfcSettings {
            throttle_enabled: get_bool(rfc_keys::THROTTLE_ENABLED),
            top_speed: self
                .rfc
                .get(rfc_keys::TOP_SPEED)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            incremental_cdl: get_bool(rfc_keys::INCREMENTAL_CDL),
            mtls_enabled: get_bool(rfc_keys::MTLS_ENABLED),
            debug_services: get_bool(rfc_keys::DEBUG_SERVICES),
            manage_notify: get_bool(rfc_keys::MANAGE_NOTIFY),
            auto_excluded: get_bool(rfc_keys::AUTO_EXCLUDED),
        }
    }

    /// Selects the cloud endpoint per the rule in §4.A. Returns an empty
    /// string when exhausted, which callers must treat as "refuse to
    /// proceed".
    #[instrument(skip(self))]
    pub fn get_server_url(&self) -> String {
        let rfc = self.rfc();
        let local_override = Path::new(LOCAL_OVERRIDE_FILE);

        if self.is_state_red() {
            let dev_like = matches!(
                self.device.build_type,
                BuildType::Dev | BuildType::Vbn | BuildType::Qa
            );
            if dev_like || rfc.debug_services {
                return std::fs::read_to_string(local_override)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
            }
            return self.rfc.get(rfc_keys::RECOVERY_URL).unwrap_or_default();
        }

        if self.device.build_type.is_non_production() && local_override.exists() {
            if let Ok(contents) = std::fs::read_to_string(local_override) {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }

        if self.device.build_type.is_non_production() {
            if let Some(auto_exclude) = self.rfc.get(rfc_keys::AUTO_EXCLUDE_URL) {
                if !auto_exclude.is_empty() {
                    return auto_exclude;
                }
            }
        }

        if let Some(bootstrap) = self.rfc.get(rfc_keys::BOOTSTRAP_URL) {
            if !bootstrap.is_empty() {
                return format!("{}/xconf/swu/stb", bootstrap.trim_end_matches('/'));
            }
        }

        if self.device.build_type == BuildType::Qa {
            if let Some(dev_xconf) = self.rfc.get(rfc_keys::DEV_XCONF_URL) {
                if !dev_xconf.is_empty() {
                    return dev_xconf;
                }
            }
        }

        let host = self
            .rfc
            .get(rfc_keys::XCONF_HOST)
            .unwrap_or_else(|| DEFAULT_XCONF_HOST.to_string());
        format!("https://{host}/xconf/swu/stb/")
    }

    /// Builds the cloud-query JSON body verbatim (§4.A field set).
    #[instrument(skip(self))]
    pub fn build_query_body(&self) -> Result<serde_json::Value, UpdateError> {
        let account_id = self
            .properties
            .get("accountID")
            .ok_or_else(|| UpdateError::Config("accountID not resolvable".into()))?;
        let timezone = self
            .properties
            .get("timezone")
            .unwrap_or_else(|| "UTC".to_string());

        debug!(model = %self.device.model, "building cloud query body");

        Ok(serde_json::json!({
            "eStbMac": self.device.estb_mac,
            "firmwareVersion": self.image.running_image_name,
            "env": format!("{:?}", self.device.build_type).to_lowercase(),
            "model": self.device.model,
            "timezone": timezone,
            "capabilities": self.device.capabilities,
            "experience": self.device.experience,
            "accountID": account_id,
            "partnerId": self.device.partner_id,
            "osClass": "rdk",
            "serialNumber": self.device.serial_number,
            "migrationReady": true,
            "rcdl": true,
            "additionalFwVerInfo": self.image.running_image_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MapStore;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn facade(build_type: BuildType, rfc: MapStore) -> ConfigFacade {
        let mut props = MapStore::default();
        props.0.insert("accountID".into(), "acct-1".into());
        props.0.insert("timezone".into(), "UTC".into());
        ConfigFacade::new(
            DeviceInfo {
                model: "MyModel".into(),
                manufacturer: "Acme".into(),
                serial_number: "SN1".into(),
                estb_mac: "AA:BB:CC:DD:EE:FF".into(),
                build_type,
                image_download_path: "/tmp/difw".into(),
                persistent_path: "/tmp/persist".into(),
                capabilities: "RCDL,TFTP".into(),
                partner_id: "partner".into(),
                experience: "X1".into(),
                maintenance_mode: false,
                software_optout: false,
            },
            ImageDetails {
                running_image_name: "MyModel_1.0.0".into(),
            },
            Arc::new(props),
            Arc::new(rfc),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn default_prod_url_uses_xconf_host() {
        let cfg = facade(BuildType::Prod, MapStore::default());
        assert_eq!(cfg.get_server_url(), "https://xconf.example.com/xconf/swu/stb/");
    }

    #[test]
    fn bootstrap_url_wins_over_default() {
        let mut rfc = MapStore::default();
        rfc.0.insert(
            rfc_keys::BOOTSTRAP_URL.to_string(),
            "https://bootstrap.example.com".into(),
        );
        let cfg = facade(BuildType::Prod, rfc);
        assert_eq!(cfg.get_server_url(), "https://bootstrap.example.com/xconf/swu/stb");
    }

    #[test]
    fn qa_build_falls_back_to_dev_xconf_when_no_bootstrap() {
        let mut rfc = MapStore::default();
        rfc.0.insert(rfc_keys::DEV_XCONF_URL.to_string(), "https://dev.example.com".into());
        let cfg = facade(BuildType::Qa, rfc);
        assert_eq!(cfg.get_server_url(), "https://dev.example.com");
    }

    #[test]
    fn query_body_has_required_fields() {
        let cfg = facade(BuildType::Prod, MapStore::default());
        let body = cfg.build_query_body().expect("body");
        assert_eq!(body["model"], "MyModel");
        assert_eq!(body["eStbMac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(body["migrationReady"], true);
    }

    #[test]
    fn missing_account_id_is_config_error() {
        let mut props = MapStore::default();
        props.0.insert("timezone".into(), "UTC".into());
        let cfg = ConfigFacade::new(
            DeviceInfo {
                model: "MyModel".into(),
                manufacturer: "Acme".into(),
                serial_number: "SN1".into(),
                estb_mac: "AA:BB:CC:DD:EE:FF".into(),
                build_type: BuildType::Prod,
                image_download_path: "/tmp/difw".into(),
                persistent_path: "/tmp/persist".into(),
                capabilities: "RCDL".into(),
                partner_id: "partner".into(),
                experience: "X1".into(),
                maintenance_mode: false,
                software_optout: false,
            },
            ImageDetails {
                running_image_name: "MyModel_1.0.0".into(),
            },
            Arc::new(props),
            Arc::new(MapStore::default()),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(cfg.build_query_body(), Err(UpdateError::Config(_))));
    }
}
