//! Common Diameter constants and small shared types

use crate::avp::{Avp, AvpValue};

/// AVP codes for the RFC 6733 base protocol AVPs
pub mod avp_code {
    pub const USER_NAME: u32 = 1;
    pub const CLASS: u32 = 25;
    pub const SESSION_TIMEOUT: u32 = 27;
    pub const PROXY_STATE: u32 = 33;
    pub const ACCOUNTING_SESSION_ID: u32 = 44;
    pub const ACCT_MULTI_SESSION_ID: u32 = 50;
    pub const EVENT_TIMESTAMP: u32 = 55;
    pub const ACCT_INTERIM_INTERVAL: u32 = 85;
    pub const HOST_IP_ADDRESS: u32 = 257;
    pub const AUTH_APPLICATION_ID: u32 = 258;
    pub const ACCT_APPLICATION_ID: u32 = 259;
    pub const VENDOR_SPECIFIC_APPLICATION_ID: u32 = 260;
    pub const REDIRECT_HOST_USAGE: u32 = 261;
    pub const REDIRECT_MAX_CACHE_TIME: u32 = 262;
    pub const SESSION_ID: u32 = 263;
    pub const ORIGIN_HOST: u32 = 264;
    pub const SUPPORTED_VENDOR_ID: u32 = 265;
    pub const VENDOR_ID: u32 = 266;
    pub const FIRMWARE_REVISION: u32 = 267;
    pub const RESULT_CODE: u32 = 268;
    pub const PRODUCT_NAME: u32 = 269;
    pub const SESSION_BINDING: u32 = 270;
    pub const SESSION_SERVER_FAILOVER: u32 = 271;
    pub const MULTI_ROUND_TIME_OUT: u32 = 272;
    pub const DISCONNECT_CAUSE: u32 = 273;
    pub const AUTH_REQUEST_TYPE: u32 = 274;
    pub const AUTH_GRACE_PERIOD: u32 = 276;
    pub const AUTH_SESSION_STATE: u32 = 277;
    pub const ORIGIN_STATE_ID: u32 = 278;
    pub const FAILED_AVP: u32 = 279;
    pub const PROXY_HOST: u32 = 280;
    pub const ERROR_MESSAGE: u32 = 281;
    pub const ROUTE_RECORD: u32 = 282;
    pub const DESTINATION_REALM: u32 = 283;
    pub const PROXY_INFO: u32 = 284;
    pub const RE_AUTH_REQUEST_TYPE: u32 = 285;
    pub const ACCOUNTING_SUB_SESSION_ID: u32 = 287;
    pub const AUTHORIZATION_LIFETIME: u32 = 291;
    pub const REDIRECT_HOST: u32 = 292;
    pub const DESTINATION_HOST: u32 = 293;
    pub const ERROR_REPORTING_HOST: u32 = 294;
    pub const TERMINATION_CAUSE: u32 = 295;
    pub const ORIGIN_REALM: u32 = 296;
    pub const EXPERIMENTAL_RESULT: u32 = 297;
    pub const EXPERIMENTAL_RESULT_CODE: u32 = 298;
    pub const INBAND_SECURITY_ID: u32 = 299;
    pub const ACCOUNTING_RECORD_TYPE: u32 = 480;
    pub const ACCOUNTING_REALTIME_REQUIRED: u32 = 483;
    pub const ACCOUNTING_RECORD_NUMBER: u32 = 485;

    // Credit-control AVPs (RFC 4006), common enough to carry in the base
    // dictionary
    pub const CC_CORRELATION_ID: u32 = 411;
    pub const CC_INPUT_OCTETS: u32 = 412;
    pub const CC_OUTPUT_OCTETS: u32 = 414;
    pub const CC_REQUEST_NUMBER: u32 = 415;
    pub const CC_REQUEST_TYPE: u32 = 416;
    pub const CC_SESSION_FAILOVER: u32 = 418;
    pub const CC_TIME: u32 = 420;
    pub const CC_TOTAL_OCTETS: u32 = 421;
    pub const GRANTED_SERVICE_UNIT: u32 = 431;
    pub const REQUESTED_SERVICE_UNIT: u32 = 437;
    pub const SUBSCRIPTION_ID: u32 = 443;
    pub const SUBSCRIPTION_ID_DATA: u32 = 444;
    pub const SUBSCRIPTION_ID_TYPE: u32 = 450;
    pub const MULTIPLE_SERVICES_CREDIT_CONTROL: u32 = 456;
    pub const SERVICE_CONTEXT_ID: u32 = 461;
}

/// Base Diameter command codes (RFC 6733, RFC 4006)
pub mod base_cmd {
    /// Capabilities-Exchange-Request/Answer
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    /// Re-Auth-Request/Answer
    pub const RE_AUTH: u32 = 258;
    /// Accounting-Request/Answer
    pub const ACCOUNTING: u32 = 271;
    /// Credit-Control-Request/Answer
    pub const CREDIT_CONTROL: u32 = 272;
    /// Abort-Session-Request/Answer
    pub const ABORT_SESSION: u32 = 274;
    /// Session-Termination-Request/Answer
    pub const SESSION_TERMINATION: u32 = 275;
    /// Device-Watchdog-Request/Answer
    pub const DEVICE_WATCHDOG: u32 = 280;
    /// Disconnect-Peer-Request/Answer
    pub const DISCONNECT_PEER: u32 = 282;
}

/// Base Diameter application ID
pub const BASE_APPLICATION_ID: u32 = 0;

/// Relay application ID; a peer advertising it accepts any application
pub const RELAY_APPLICATION_ID: u32 = 0xffff_ffff;

/// Disconnect cause values for DPR (RFC 6733 Section 5.4.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectCause {
    Rebooting = 0,
    Busy = 1,
    DoNotWantToTalkToYou = 2,
}

/// Vendor-Specific-Application-Id grouped AVP contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorSpecificApplicationId {
    pub vendor_id: u32,
    pub auth_application_id: Option<u32>,
    pub acct_application_id: Option<u32>,
}

impl VendorSpecificApplicationId {
    /// Build the grouped AVP representation
    pub fn to_avp(&self) -> Avp {
        let mut inner = vec![Avp::mandatory(
            avp_code::VENDOR_ID,
            AvpValue::Unsigned32(self.vendor_id),
        )];
        if let Some(id) = self.auth_application_id {
            inner.push(Avp::mandatory(
                avp_code::AUTH_APPLICATION_ID,
                AvpValue::Unsigned32(id),
            ));
        }
        if let Some(id) = self.acct_application_id {
            inner.push(Avp::mandatory(
                avp_code::ACCT_APPLICATION_ID,
                AvpValue::Unsigned32(id),
            ));
        }
        Avp::mandatory(
            avp_code::VENDOR_SPECIFIC_APPLICATION_ID,
            AvpValue::Grouped(inner),
        )
    }

    /// Extract from a grouped AVP, if it has the right shape
    pub fn from_avp(avp: &Avp) -> Option<Self> {
        let inner = avp.as_grouped()?;
        let vendor_id = crate::avp::find_avp(inner, avp_code::VENDOR_ID)?.as_u32()?;
        let auth_application_id =
            crate::avp::find_avp(inner, avp_code::AUTH_APPLICATION_ID).and_then(Avp::as_u32);
        let acct_application_id =
            crate::avp::find_avp(inner, avp_code::ACCT_APPLICATION_ID).and_then(Avp::as_u32);
        Some(Self {
            vendor_id,
            auth_application_id,
            acct_application_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_specific_application_id_round_trip() {
        let vsa = VendorSpecificApplicationId {
            vendor_id: 10415,
            auth_application_id: Some(16777251),
            acct_application_id: None,
        };
        let avp = vsa.to_avp();
        assert_eq!(avp.code, avp_code::VENDOR_SPECIFIC_APPLICATION_ID);
        assert_eq!(VendorSpecificApplicationId::from_avp(&avp), Some(vsa));
    }

    #[test]
    fn test_vendor_specific_application_id_rejects_flat_avp() {
        let avp = Avp::mandatory(avp_code::VENDOR_ID, AvpValue::Unsigned32(10415));
        assert_eq!(VendorSpecificApplicationId::from_avp(&avp), None);
    }
}
