//! OPC UA status code table (§6 `suppressed-opc-status-codes`, §7 node
//! resolution / session invalidation error kinds).
//!
//! The status code space itself belongs to the OPC UA stack (§1
//! Non-goals); this module only carries the small subset of symbolic names
//! the gateway's own logic branches on, so `suppressed-opc-status-codes`
//! can be configured by name instead of requiring operators to memorize
//! hex codes.

/// Known symbolic status codes the gateway's own logic references.
pub const GOOD: u32 = 0x0000_0000;
pub const BAD_NO_COMMUNICATION: u32 = 0x8048_0000;
pub const BAD_WAITING_FOR_INITIAL_DATA: u32 = 0x8046_0000;
pub const BAD_SESSION_ID_INVALID: u32 = 0x8025_0000;
pub const BAD_SUBSCRIPTION_ID_INVALID: u32 = 0x8028_0000;
pub const BAD_NODE_ID_INVALID: u32 = 0x8033_0000;
pub const BAD_NODE_ID_UNKNOWN: u32 = 0x8034_0000;
pub const BAD_OUT_OF_SERVICE: u32 = 0x8024_0000;

/// Resolve a symbolic status name (e.g. `"BadNoCommunication"`) or a literal
/// hex code (e.g. `"0x80480000"`) to its numeric form. Unknown symbolic
/// names return `None` rather than a guess; unparsable hex likewise.
pub fn symbolic_to_code(name: &str) -> Option<u32> {
    match name {
        "Good" => Some(GOOD),
        "BadNoCommunication" => Some(BAD_NO_COMMUNICATION),
        "BadWaitingForInitialData" => Some(BAD_WAITING_FOR_INITIAL_DATA),
        "BadSessionIdInvalid" => Some(BAD_SESSION_ID_INVALID),
        "BadSubscriptionIdInvalid" => Some(BAD_SUBSCRIPTION_ID_INVALID),
        "BadNodeIdInvalid" => Some(BAD_NODE_ID_INVALID),
        "BadNodeIdUnknown" => Some(BAD_NODE_ID_UNKNOWN),
        "BadOutOfService" => Some(BAD_OUT_OF_SERVICE),
        other => other
            .strip_prefix("0x")
            .or_else(|| other.strip_prefix("0X"))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok()),
    }
}

/// The symbolic name for a known code, for display in telemetry records
/// and logs; falls back to a hex literal for anything not in the table.
pub fn code_to_symbolic(code: u32) -> String {
    match code {
        GOOD => "Good".to_string(),
        BAD_NO_COMMUNICATION => "BadNoCommunication".to_string(),
        BAD_WAITING_FOR_INITIAL_DATA => "BadWaitingForInitialData".to_string(),
        BAD_SESSION_ID_INVALID => "BadSessionIdInvalid".to_string(),
        BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid".to_string(),
        BAD_NODE_ID_INVALID => "BadNodeIdInvalid".to_string(),
        BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown".to_string(),
        BAD_OUT_OF_SERVICE => "BadOutOfService".to_string(),
        other => format!("0x{other:08X}"),
    }
}
