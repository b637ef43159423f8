//! Process-wide Diameter dictionary.
//!
//! Maps (AVP code, vendor id) to name, type and default flags, and command
//! codes to names. The base protocol table is registered at first use;
//! additional tables can be registered at runtime, either one definition at
//! a time or from a YAML table (rows `{code, vendor, name, type, mandatory,
//! protected}` and `{code, name, request, proxyable}`).
//!
//! Registration overwrites silently; the last writer wins. The store is
//! read-mostly: writers clone the tables and swap an `Arc`, readers take a
//! snapshot pointer and never block each other.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Deserialize;

use crate::common::avp_code;
use crate::error::{DiameterError, DiameterResult};

/// Wire types an AVP payload can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AvpType {
    OctetString,
    #[serde(rename = "UTF8String")]
    Utf8String,
    Integer32,
    Integer64,
    Unsigned32,
    Unsigned64,
    Float32,
    Float64,
    Address,
    Time,
    DiameterIdentity,
    #[serde(rename = "DiameterURI")]
    DiameterUri,
    Enumerated,
    Grouped,
}

/// A single AVP definition
#[derive(Debug, Clone)]
pub struct AvpDef {
    pub code: u32,
    pub vendor_id: u32,
    pub name: String,
    pub avp_type: AvpType,
    pub mandatory: bool,
    pub protected: bool,
}

/// A single command definition
#[derive(Debug, Clone)]
pub struct CommandDef {
    pub code: u32,
    pub name: String,
    pub proxyable: bool,
}

#[derive(Clone, Default)]
struct Tables {
    // base AVPs keyed by code, vendor AVPs keyed by (vendor, code)
    avps: HashMap<u32, Arc<AvpDef>>,
    vendor_avps: HashMap<(u32, u32), Arc<AvpDef>>,
    commands: HashMap<u32, Arc<CommandDef>>,
}

fn registry() -> &'static RwLock<Arc<Tables>> {
    static REGISTRY: OnceLock<RwLock<Arc<Tables>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Arc::new(base_tables())))
}

fn snapshot() -> Arc<Tables> {
    registry().read().expect("dictionary lock poisoned").clone()
}

fn mutate(f: impl FnOnce(&mut Tables)) {
    let mut guard = registry().write().expect("dictionary lock poisoned");
    let mut tables = (**guard).clone();
    f(&mut tables);
    *guard = Arc::new(tables);
}

/// Look up an AVP definition by code and vendor id (0 for no vendor)
pub fn lookup_avp(code: u32, vendor_id: u32) -> Option<Arc<AvpDef>> {
    let tables = snapshot();
    if vendor_id == 0 {
        tables.avps.get(&code).cloned()
    } else {
        tables.vendor_avps.get(&(vendor_id, code)).cloned()
    }
}

/// Look up a command definition by command code
pub fn lookup_command(code: u32) -> Option<Arc<CommandDef>> {
    snapshot().commands.get(&code).cloned()
}

/// Human-readable command name, falling back to the numeric code
pub fn command_name(code: u32) -> String {
    match lookup_command(code) {
        Some(def) => def.name.clone(),
        None => format!("Command-{code}"),
    }
}

/// Register (or overwrite) an AVP definition
pub fn register_avp(def: AvpDef) {
    mutate(|tables| {
        let def = Arc::new(def);
        if def.vendor_id == 0 {
            tables.avps.insert(def.code, def);
        } else {
            tables.vendor_avps.insert((def.vendor_id, def.code), def);
        }
    });
}

/// Register (or overwrite) a command definition
pub fn register_command(def: CommandDef) {
    mutate(|tables| {
        tables.commands.insert(def.code, Arc::new(def));
    });
}

#[derive(Debug, Deserialize)]
struct AvpRow {
    code: u32,
    #[serde(default)]
    vendor: u32,
    name: String,
    #[serde(rename = "type")]
    avp_type: AvpType,
    #[serde(default)]
    mandatory: bool,
    #[serde(default)]
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct CommandRow {
    code: u32,
    name: String,
    #[serde(default)]
    proxyable: bool,
}

#[derive(Debug, Deserialize)]
struct DictionaryFile {
    #[serde(default)]
    avps: Vec<AvpRow>,
    #[serde(default)]
    commands: Vec<CommandRow>,
}

/// Load a YAML dictionary table, registering every row. Returns the number
/// of definitions registered.
pub fn load_yaml(text: &str) -> DiameterResult<usize> {
    let file: DictionaryFile =
        serde_yaml::from_str(text).map_err(|e| DiameterError::Dictionary(e.to_string()))?;
    let count = file.avps.len() + file.commands.len();
    mutate(|tables| {
        for row in file.avps {
            let def = Arc::new(AvpDef {
                code: row.code,
                vendor_id: row.vendor,
                name: row.name,
                avp_type: row.avp_type,
                mandatory: row.mandatory,
                protected: row.protected,
            });
            if def.vendor_id == 0 {
                tables.avps.insert(def.code, def);
            } else {
                tables.vendor_avps.insert((def.vendor_id, def.code), def);
            }
        }
        for row in file.commands {
            tables.commands.insert(
                row.code,
                Arc::new(CommandDef {
                    code: row.code,
                    name: row.name,
                    proxyable: row.proxyable,
                }),
            );
        }
    });
    Ok(count)
}

fn base_tables() -> Tables {
    use AvpType::*;

    let mut tables = Tables::default();

    let avp_defs: &[(u32, &str, AvpType, bool)] = &[
        (avp_code::USER_NAME, "User-Name", Utf8String, true),
        (avp_code::CLASS, "Class", OctetString, true),
        (avp_code::SESSION_TIMEOUT, "Session-Timeout", Unsigned32, true),
        (avp_code::PROXY_STATE, "Proxy-State", OctetString, true),
        (avp_code::ACCOUNTING_SESSION_ID, "Accounting-Session-Id", OctetString, true),
        (avp_code::ACCT_MULTI_SESSION_ID, "Acct-Multi-Session-Id", Utf8String, true),
        (avp_code::EVENT_TIMESTAMP, "Event-Timestamp", Time, true),
        (avp_code::ACCT_INTERIM_INTERVAL, "Acct-Interim-Interval", Unsigned32, true),
        (avp_code::HOST_IP_ADDRESS, "Host-IP-Address", Address, true),
        (avp_code::AUTH_APPLICATION_ID, "Auth-Application-Id", Unsigned32, true),
        (avp_code::ACCT_APPLICATION_ID, "Acct-Application-Id", Unsigned32, true),
        (
            avp_code::VENDOR_SPECIFIC_APPLICATION_ID,
            "Vendor-Specific-Application-Id",
            Grouped,
            true,
        ),
        (avp_code::REDIRECT_HOST_USAGE, "Redirect-Host-Usage", Enumerated, true),
        (avp_code::REDIRECT_MAX_CACHE_TIME, "Redirect-Max-Cache-Time", Unsigned32, true),
        (avp_code::SESSION_ID, "Session-Id", Utf8String, true),
        (avp_code::ORIGIN_HOST, "Origin-Host", DiameterIdentity, true),
        (avp_code::SUPPORTED_VENDOR_ID, "Supported-Vendor-Id", Unsigned32, true),
        (avp_code::VENDOR_ID, "Vendor-Id", Unsigned32, true),
        (avp_code::FIRMWARE_REVISION, "Firmware-Revision", Unsigned32, false),
        (avp_code::RESULT_CODE, "Result-Code", Unsigned32, true),
        (avp_code::PRODUCT_NAME, "Product-Name", Utf8String, false),
        (avp_code::SESSION_BINDING, "Session-Binding", Unsigned32, true),
        (avp_code::SESSION_SERVER_FAILOVER, "Session-Server-Failover", Enumerated, true),
        (avp_code::MULTI_ROUND_TIME_OUT, "Multi-Round-Time-Out", Unsigned32, true),
        (avp_code::DISCONNECT_CAUSE, "Disconnect-Cause", Enumerated, true),
        (avp_code::AUTH_REQUEST_TYPE, "Auth-Request-Type", Enumerated, true),
        (avp_code::AUTH_GRACE_PERIOD, "Auth-Grace-Period", Unsigned32, true),
        (avp_code::AUTH_SESSION_STATE, "Auth-Session-State", Enumerated, true),
        (avp_code::ORIGIN_STATE_ID, "Origin-State-Id", Unsigned32, true),
        (avp_code::FAILED_AVP, "Failed-AVP", Grouped, true),
        (avp_code::ERROR_MESSAGE, "Error-Message", Utf8String, false),
        (avp_code::PROXY_HOST, "Proxy-Host", DiameterIdentity, true),
        (avp_code::ROUTE_RECORD, "Route-Record", DiameterIdentity, true),
        (avp_code::DESTINATION_REALM, "Destination-Realm", DiameterIdentity, true),
        (avp_code::PROXY_INFO, "Proxy-Info", Grouped, true),
        (avp_code::RE_AUTH_REQUEST_TYPE, "Re-Auth-Request-Type", Enumerated, true),
        (
            avp_code::ACCOUNTING_SUB_SESSION_ID,
            "Accounting-Sub-Session-Id",
            Unsigned64,
            true,
        ),
        (avp_code::AUTHORIZATION_LIFETIME, "Authorization-Lifetime", Unsigned32, true),
        (avp_code::REDIRECT_HOST, "Redirect-Host", DiameterUri, true),
        (avp_code::DESTINATION_HOST, "Destination-Host", DiameterIdentity, true),
        (avp_code::ERROR_REPORTING_HOST, "Error-Reporting-Host", DiameterIdentity, false),
        (avp_code::TERMINATION_CAUSE, "Termination-Cause", Enumerated, true),
        (avp_code::ORIGIN_REALM, "Origin-Realm", DiameterIdentity, true),
        (avp_code::EXPERIMENTAL_RESULT, "Experimental-Result", Grouped, true),
        (
            avp_code::EXPERIMENTAL_RESULT_CODE,
            "Experimental-Result-Code",
            Unsigned32,
            true,
        ),
        (avp_code::INBAND_SECURITY_ID, "Inband-Security-Id", Unsigned32, true),
        (avp_code::ACCOUNTING_RECORD_TYPE, "Accounting-Record-Type", Enumerated, true),
        (
            avp_code::ACCOUNTING_REALTIME_REQUIRED,
            "Accounting-Realtime-Required",
            Enumerated,
            true,
        ),
        (
            avp_code::ACCOUNTING_RECORD_NUMBER,
            "Accounting-Record-Number",
            Unsigned32,
            true,
        ),
        (avp_code::CC_CORRELATION_ID, "CC-Correlation-Id", OctetString, true),
        (avp_code::CC_INPUT_OCTETS, "CC-Input-Octets", Unsigned64, true),
        (avp_code::CC_OUTPUT_OCTETS, "CC-Output-Octets", Unsigned64, true),
        (avp_code::CC_REQUEST_NUMBER, "CC-Request-Number", Unsigned32, true),
        (avp_code::CC_REQUEST_TYPE, "CC-Request-Type", Enumerated, true),
        (avp_code::CC_SESSION_FAILOVER, "CC-Session-Failover", Enumerated, true),
        (avp_code::CC_TIME, "CC-Time", Unsigned32, true),
        (avp_code::CC_TOTAL_OCTETS, "CC-Total-Octets", Unsigned64, true),
        (avp_code::GRANTED_SERVICE_UNIT, "Granted-Service-Unit", Grouped, true),
        (avp_code::REQUESTED_SERVICE_UNIT, "Requested-Service-Unit", Grouped, true),
        (avp_code::SUBSCRIPTION_ID, "Subscription-Id", Grouped, true),
        (avp_code::SUBSCRIPTION_ID_DATA, "Subscription-Id-Data", Utf8String, true),
        (avp_code::SUBSCRIPTION_ID_TYPE, "Subscription-Id-Type", Enumerated, true),
        (
            avp_code::MULTIPLE_SERVICES_CREDIT_CONTROL,
            "Multiple-Services-Credit-Control",
            Grouped,
            true,
        ),
        (avp_code::SERVICE_CONTEXT_ID, "Service-Context-Id", Utf8String, true),
    ];

    for (code, name, avp_type, mandatory) in avp_defs {
        tables.avps.insert(
            *code,
            Arc::new(AvpDef {
                code: *code,
                vendor_id: 0,
                name: (*name).to_string(),
                avp_type: *avp_type,
                mandatory: *mandatory,
                protected: false,
            }),
        );
    }

    let command_defs: &[(u32, &str, bool)] = &[
        (crate::common::base_cmd::CAPABILITIES_EXCHANGE, "Capabilities-Exchange", false),
        (crate::common::base_cmd::RE_AUTH, "Re-Auth", true),
        (crate::common::base_cmd::ACCOUNTING, "Accounting", true),
        (crate::common::base_cmd::CREDIT_CONTROL, "Credit-Control", true),
        (crate::common::base_cmd::ABORT_SESSION, "Abort-Session", true),
        (crate::common::base_cmd::SESSION_TERMINATION, "Session-Termination", true),
        (crate::common::base_cmd::DEVICE_WATCHDOG, "Device-Watchdog", false),
        (crate::common::base_cmd::DISCONNECT_PEER, "Disconnect-Peer", false),
    ];

    for (code, name, proxyable) in command_defs {
        tables.commands.insert(
            *code,
            Arc::new(CommandDef {
                code: *code,
                name: (*name).to_string(),
                proxyable: *proxyable,
            }),
        );
    }

    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_table_lookup() {
        let def = lookup_avp(avp_code::SESSION_ID, 0).unwrap();
        assert_eq!(def.name, "Session-Id");
        assert_eq!(def.avp_type, AvpType::Utf8String);
        assert!(def.mandatory);

        let cmd = lookup_command(272).unwrap();
        assert_eq!(cmd.name, "Credit-Control");
        assert!(cmd.proxyable);

        assert!(lookup_avp(999_999, 0).is_none());
        assert_eq!(command_name(999_999), "Command-999999");
    }

    #[test]
    fn test_register_overwrites_silently() {
        register_avp(AvpDef {
            code: 900_001,
            vendor_id: 0,
            name: "X-First".into(),
            avp_type: AvpType::Unsigned32,
            mandatory: false,
            protected: false,
        });
        register_avp(AvpDef {
            code: 900_001,
            vendor_id: 0,
            name: "X-Second".into(),
            avp_type: AvpType::Utf8String,
            mandatory: true,
            protected: false,
        });
        let def = lookup_avp(900_001, 0).unwrap();
        assert_eq!(def.name, "X-Second");
        assert_eq!(def.avp_type, AvpType::Utf8String);
    }

    #[test]
    fn test_vendor_namespace_is_separate() {
        register_avp(AvpDef {
            code: 900_002,
            vendor_id: 10415,
            name: "X-Vendor".into(),
            avp_type: AvpType::Unsigned32,
            mandatory: true,
            protected: false,
        });
        assert!(lookup_avp(900_002, 0).is_none());
        assert_eq!(lookup_avp(900_002, 10415).unwrap().name, "X-Vendor");
    }

    #[test]
    fn test_load_yaml_table() {
        let loaded = load_yaml(
            r#"
avps:
  - { code: 900101, name: X-Counter, type: Unsigned64, mandatory: true }
  - { code: 900102, vendor: 4242, name: X-Label, type: UTF8String }
commands:
  - { code: 900100, name: X-Command, proxyable: true }
"#,
        )
        .unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(lookup_avp(900_101, 0).unwrap().avp_type, AvpType::Unsigned64);
        assert!(!lookup_avp(900_102, 4242).unwrap().mandatory);
        assert_eq!(command_name(900_100), "X-Command");
    }

    #[test]
    fn test_load_yaml_rejects_garbage() {
        assert!(matches!(
            load_yaml("avps: {not: a list}"),
            Err(DiameterError::Dictionary(_))
        ));
    }

    #[test]
    fn test_concurrent_readers_during_registration() {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..200 {
                        let _ = lookup_avp(avp_code::SESSION_ID, 0).unwrap();
                    }
                })
            })
            .collect();
        for i in 0..50u32 {
            register_avp(AvpDef {
                code: 910_000 + i,
                vendor_id: 0,
                name: format!("X-Churn-{i}"),
                avp_type: AvpType::OctetString,
                mandatory: false,
                protected: false,
            });
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
