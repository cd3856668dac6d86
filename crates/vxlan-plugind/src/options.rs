//! Option parsing: untyped option bags in, a typed [`LinkConfig`] out.
//!
//! Nothing past this module looks at raw option keys. Options arrive either
//! nested under [`GENERIC_OPTIONS_KEY`] (network create requests) or flat
//! (network inspect); [`flatten_options`] folds both into one bag.
//!
//! Coercions follow the conventions operators already use with this driver:
//! decimal integers (with base prefixes for `VxlanId`), `strconv`-style
//! booleans, colon or hyphen separated MACs.

use std::collections::HashMap;
use std::net::IpAddr;
use vxlan_common::{DriverError, DriverResult, VtepRef, VxlanAttrs};
use vxlan_types::{MacAddress, NetworkId, IFNAMSIZ};

/// Key under which network create requests nest driver options.
pub const GENERIC_OPTIONS_KEY: &str = "com.docker.network.generic";

/// Recognised option keys.
pub mod keys {
    pub const VXLAN_NAME: &str = "vxlanName";
    pub const VXLAN_MTU: &str = "vxlanMTU";
    pub const VXLAN_HARDWARE_ADDR: &str = "vxlanHardwareAddr";
    pub const VXLAN_TX_QLEN: &str = "vxlanTxQLen";
    pub const BRIDGE_NAME: &str = "bridgeName";
    pub const BRIDGE_MTU: &str = "bridgeMTU";
    pub const BRIDGE_HARDWARE_ADDR: &str = "bridgeHardwareAddr";
    pub const BRIDGE_TX_QLEN: &str = "bridgeTxQLen";
    pub const VXLAN_ID: &str = "VxlanId";
    pub const VTEP_DEV: &str = "VtepDev";
    pub const SRC_ADDR: &str = "SrcAddr";
    pub const GROUP: &str = "Group";
    pub const TTL: &str = "TTL";
    pub const TOS: &str = "TOS";
    pub const LEARNING: &str = "Learning";
    pub const PROXY: &str = "Proxy";
    pub const RSC: &str = "RSC";
    pub const L2MISS: &str = "L2miss";
    pub const L3MISS: &str = "L3miss";
    pub const NO_AGE: &str = "NoAge";
    pub const GBP: &str = "GBP";
    pub const AGE: &str = "Age";
    pub const LIMIT: &str = "Limit";
    pub const PORT: &str = "Port";
    pub const PORT_LOW: &str = "PortLow";
    pub const PORT_HIGH: &str = "PortHigh";
    pub const BLOCK_GATEWAY_ARP: &str = "blockGatewayArp";
    pub const GLOBAL_GATEWAY: &str = "globalGateway";

    /// Keys whose presence selects dual-tier (bridge) mode.
    pub const BRIDGE_KEYS: [&str; 4] = [BRIDGE_NAME, BRIDGE_MTU, BRIDGE_HARDWARE_ADDR, BRIDGE_TX_QLEN];
}

/// Largest VXLAN network identifier (24 bits).
const MAX_VNI: i64 = (1 << 24) - 1;

/// Per-device attributes shared by the VXLAN device and the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub mtu: Option<u32>,
    pub hardware_addr: Option<MacAddress>,
    pub tx_queue_len: Option<u32>,
}

impl DeviceConfig {
    fn named(name: String) -> Self {
        Self {
            name,
            mtu: None,
            hardware_addr: None,
            tx_queue_len: None,
        }
    }
}

/// Resolved configuration for one network's devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub vxlan: DeviceConfig,
    /// Present in dual-tier mode only.
    pub bridge: Option<DeviceConfig>,
    pub vni: u32,
    /// Per-network tunnel-endpoint device. Wins over the driver-wide default.
    pub vtep_dev: Option<String>,
    pub src_addr: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub tos: Option<u8>,
    pub learning: Option<bool>,
    pub proxy: Option<bool>,
    pub rsc: Option<bool>,
    pub l2miss: Option<bool>,
    pub l3miss: Option<bool>,
    pub no_age: Option<bool>,
    pub gbp: Option<bool>,
    pub age: Option<u32>,
    pub limit: Option<u32>,
    pub port: Option<u16>,
    pub port_range: Option<(u16, u16)>,
    pub block_gateway_arp: bool,
    pub global_gateway: bool,
}

impl LinkConfig {
    /// The configuration of a network with no options at all.
    pub fn defaults(network: &NetworkId) -> Self {
        Self {
            vxlan: DeviceConfig::named(network.vxlan_name()),
            bridge: None,
            vni: 0,
            vtep_dev: None,
            src_addr: None,
            group: None,
            ttl: None,
            tos: None,
            learning: None,
            proxy: None,
            rsc: None,
            l2miss: None,
            l3miss: None,
            no_age: None,
            gbp: None,
            age: None,
            limit: None,
            port: None,
            port_range: None,
            block_gateway_arp: false,
            global_gateway: false,
        }
    }

    /// Parses a flat option bag. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidOption`] on the first value that fails to coerce
    /// or is out of range.
    pub fn parse(network: &NetworkId, options: &HashMap<String, String>) -> DriverResult<Self> {
        let opts = Options(options);
        let mut config = Self::defaults(network);

        if let Some(name) = opts.device_name(keys::VXLAN_NAME)? {
            config.vxlan.name = name;
        }
        config.vxlan.mtu = opts.uint(keys::VXLAN_MTU)?;
        config.vxlan.hardware_addr = opts.mac(keys::VXLAN_HARDWARE_ADDR)?;
        config.vxlan.tx_queue_len = opts.uint(keys::VXLAN_TX_QLEN)?;

        if keys::BRIDGE_KEYS.iter().any(|k| options.contains_key(*k)) {
            let mut bridge = DeviceConfig::named(network.bridge_name());
            if let Some(name) = opts.device_name(keys::BRIDGE_NAME)? {
                bridge.name = name;
            }
            bridge.mtu = opts.uint(keys::BRIDGE_MTU)?;
            bridge.hardware_addr = opts.mac(keys::BRIDGE_HARDWARE_ADDR)?;
            bridge.tx_queue_len = opts.uint(keys::BRIDGE_TX_QLEN)?;
            if bridge.name == config.vxlan.name {
                return Err(DriverError::invalid_option(
                    keys::BRIDGE_NAME,
                    bridge.name,
                    "bridge and vxlan devices need distinct names",
                ));
            }
            config.bridge = Some(bridge);
        }

        if let Some(vni) = opts.int_any_base(keys::VXLAN_ID)? {
            config.vni = bounded(keys::VXLAN_ID, options, vni, 0, MAX_VNI)?;
        }
        config.vtep_dev = opts.device_name(keys::VTEP_DEV)?;
        config.src_addr = opts.ip(keys::SRC_ADDR)?;
        config.group = opts.ip(keys::GROUP)?;
        config.ttl = opts.bounded_int(keys::TTL, 0, i64::from(u8::MAX))?;
        config.tos = opts.bounded_int(keys::TOS, 0, i64::from(u8::MAX))?;
        config.learning = opts.bool(keys::LEARNING)?;
        config.proxy = opts.bool(keys::PROXY)?;
        config.rsc = opts.bool(keys::RSC)?;
        config.l2miss = opts.bool(keys::L2MISS)?;
        config.l3miss = opts.bool(keys::L3MISS)?;
        config.no_age = opts.bool(keys::NO_AGE)?;
        config.gbp = opts.bool(keys::GBP)?;
        config.age = opts.uint(keys::AGE)?;
        config.limit = opts.uint(keys::LIMIT)?;
        config.port = opts.bounded_int(keys::PORT, 0, i64::from(u16::MAX))?;

        let low: Option<u16> = opts.bounded_int(keys::PORT_LOW, 0, i64::from(u16::MAX))?;
        let high: Option<u16> = opts.bounded_int(keys::PORT_HIGH, 0, i64::from(u16::MAX))?;
        config.port_range = match (low, high) {
            (None, None) => None,
            (Some(low), Some(high)) if low <= high => Some((low, high)),
            (Some(low), Some(high)) => {
                return Err(DriverError::invalid_option(
                    keys::PORT_LOW,
                    low.to_string(),
                    format!("must not exceed {} ({})", keys::PORT_HIGH, high),
                ))
            }
            (Some(_), None) | (None, Some(_)) => {
                let (key, missing) = if low.is_some() {
                    (keys::PORT_LOW, keys::PORT_HIGH)
                } else {
                    (keys::PORT_HIGH, keys::PORT_LOW)
                };
                return Err(DriverError::invalid_option(
                    key,
                    options.get(key).cloned().unwrap_or_default(),
                    format!("requires {} as well", missing),
                ));
            }
        };

        config.block_gateway_arp = opts.bool(keys::BLOCK_GATEWAY_ARP)?.unwrap_or(false);
        config.global_gateway = opts.bool(keys::GLOBAL_GATEWAY)?.unwrap_or(false);

        Ok(config)
    }

    pub fn is_dual_tier(&self) -> bool {
        self.bridge.is_some()
    }

    /// Picks the tunnel-endpoint device: the per-network option, else the
    /// driver-wide default.
    pub fn effective_vtep<'a>(&'a self, driver_default: Option<&'a str>) -> Option<&'a str> {
        self.vtep_dev.as_deref().or(driver_default)
    }

    /// VXLAN attributes for device creation, with the resolved tunnel endpoint.
    pub fn vxlan_attrs(&self, vtep: Option<VtepRef>) -> VxlanAttrs {
        VxlanAttrs {
            vni: self.vni,
            vtep,
            src_addr: self.src_addr,
            group: self.group,
            ttl: self.ttl,
            tos: self.tos,
            learning: self.learning,
            proxy: self.proxy,
            rsc: self.rsc,
            l2miss: self.l2miss,
            l3miss: self.l3miss,
            no_age: self.no_age,
            gbp: self.gbp,
            age: self.age,
            limit: self.limit,
            port: self.port,
            port_range: self.port_range,
        }
    }
}

/// Folds a JSON option object into one flat string bag.
///
/// Entries nested under [`GENERIC_OPTIONS_KEY`] take precedence over
/// top-level entries of the same name. Booleans and numbers are rendered
/// to strings; nulls, arrays and other objects are dropped.
pub fn flatten_options(value: &serde_json::Value) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    let Some(map) = value.as_object() else {
        return flat;
    };

    for (key, value) in map {
        if key == GENERIC_OPTIONS_KEY {
            continue;
        }
        if let Some(s) = scalar_to_string(value) {
            flat.insert(key.clone(), s);
        }
    }

    if let Some(generic) = map.get(GENERIC_OPTIONS_KEY).and_then(|v| v.as_object()) {
        for (key, value) in generic {
            if let Some(s) = scalar_to_string(value) {
                flat.insert(key.clone(), s);
            }
        }
    }

    flat
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses a boolean the way Go's `strconv.ParseBool` does.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Parses an integer with an optional sign and base prefix: `0x` hex,
/// `0o` or a bare leading `0` octal, `0b` binary, otherwise decimal.
pub fn parse_int_any_base(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let lower = digits.to_ascii_lowercase();
    let (radix, body) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest.to_string())
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest.to_string())
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest.to_string())
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, lower[1..].to_string())
    } else {
        (10, lower)
    };

    if body.is_empty() || body.starts_with(['+', '-']) {
        return None;
    }
    let value = i64::from_str_radix(&body, radix).ok()?;
    Some(if negative { -value } else { value })
}

fn bounded<T: TryFrom<i64>>(
    key: &str,
    options: &HashMap<String, String>,
    value: i64,
    min: i64,
    max: i64,
) -> DriverResult<T> {
    if value < min || value > max {
        return Err(DriverError::invalid_option(
            key,
            options.get(key).cloned().unwrap_or_default(),
            format!("out of range [{}, {}]", min, max),
        ));
    }
    T::try_from(value).map_err(|_| {
        DriverError::invalid_option(
            key,
            options.get(key).cloned().unwrap_or_default(),
            "out of range",
        )
    })
}

/// Typed accessors over a flat option bag.
struct Options<'a>(&'a HashMap<String, String>);

impl Options<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn invalid(&self, key: &str, reason: impl Into<String>) -> DriverError {
        DriverError::invalid_option(key, self.raw(key).unwrap_or_default(), reason)
    }

    fn int(&self, key: &str) -> DriverResult<Option<i64>> {
        self.raw(key)
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|e| self.invalid(key, format!("not an integer: {}", e)))
            })
            .transpose()
    }

    fn int_any_base(&self, key: &str) -> DriverResult<Option<i64>> {
        self.raw(key)
            .map(|v| parse_int_any_base(v).ok_or_else(|| self.invalid(key, "not an integer")))
            .transpose()
    }

    fn bounded_int<T: TryFrom<i64>>(&self, key: &str, min: i64, max: i64) -> DriverResult<Option<T>> {
        self.int(key)?
            .map(|v| bounded(key, self.0, v, min, max))
            .transpose()
    }

    fn uint(&self, key: &str) -> DriverResult<Option<u32>> {
        self.bounded_int(key, 0, i64::from(u32::MAX))
    }

    fn bool(&self, key: &str) -> DriverResult<Option<bool>> {
        self.raw(key)
            .map(|v| parse_bool(v).ok_or_else(|| self.invalid(key, "not a boolean")))
            .transpose()
    }

    fn mac(&self, key: &str) -> DriverResult<Option<MacAddress>> {
        self.raw(key)
            .map(|v| {
                v.parse::<MacAddress>()
                    .map_err(|_| self.invalid(key, "not a MAC address"))
            })
            .transpose()
    }

    fn ip(&self, key: &str) -> DriverResult<Option<IpAddr>> {
        self.raw(key)
            .map(|v| v.parse::<IpAddr>().map_err(|_| self.invalid(key, "not an IP address")))
            .transpose()
    }

    fn device_name(&self, key: &str) -> DriverResult<Option<String>> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) if v.is_empty() => Err(self.invalid(key, "empty device name")),
            Some(v) if v.len() >= IFNAMSIZ => Err(self.invalid(
                key,
                format!("device names are limited to {} bytes", IFNAMSIZ - 1),
            )),
            Some(v) if v.contains(['/', ' ']) || v.chars().any(char::is_control) => {
                Err(self.invalid(key, "invalid character in device name"))
            }
            Some(v) => Ok(Some(v.to_string())),
        }
    }
}
