//! Per-call options.

use serde::{Deserialize, Serialize};

const VERBOSE: u32 = 0x0001;
const ALLOW_SUICIDE: u32 = 0x0002;
const MANUAL_ACK: u32 = 0x0008;
const DISCARD_REPLY: u32 = 0x0010;
const CS_NODEID: u32 = 0x0200;
const SYNC_CALL: u32 = 0x1000;
const TIMEOUT_UPDATES: u32 = 0x2000;
const REPORT_ONLY_SUCCESS: u32 = 0x4000;

/// How a call to the fencer should be handled.
///
/// On the wire this travels as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct CallOptions {
    /// Ask the fencer for extra detail in its logs.
    pub verbose: bool,
    /// The target may be the node we are running on.
    pub allow_suicide: bool,
    /// The operator confirms the target is already down; nothing gets executed.
    pub manual_ack: bool,
    /// Do not hand the reply payload back to the caller.
    pub discard_reply: bool,
    /// The target is a numeric cluster node id rather than a name.
    pub cs_nodeid: bool,
    /// Block until the fencer replies.
    pub sync_call: bool,
    /// Let the fencer push new deadlines for this call's callback timer.
    pub timeout_updates: bool,
    /// Only run the callback when the call succeeded.
    pub report_only_success: bool,
}

impl CallOptions {
    /// Options for a blocking call.
    #[must_use]
    pub fn sync() -> Self {
        Self {
            sync_call: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_sync_call(mut self, on: bool) -> Self {
        self.sync_call = on;
        self
    }

    #[must_use]
    pub const fn with_allow_suicide(mut self, on: bool) -> Self {
        self.allow_suicide = on;
        self
    }

    #[must_use]
    pub const fn with_manual_ack(mut self, on: bool) -> Self {
        self.manual_ack = on;
        self
    }

    #[must_use]
    pub const fn with_cs_nodeid(mut self, on: bool) -> Self {
        self.cs_nodeid = on;
        self
    }

    #[must_use]
    pub const fn with_timeout_updates(mut self, on: bool) -> Self {
        self.timeout_updates = on;
        self
    }

    #[must_use]
    pub const fn with_report_only_success(mut self, on: bool) -> Self {
        self.report_only_success = on;
        self
    }

    #[must_use]
    pub const fn with_discard_reply(mut self, on: bool) -> Self {
        self.discard_reply = on;
        self
    }

    /// Wire bitmask.
    pub const fn bits(self) -> u32 {
        let flags = [
            (self.verbose, VERBOSE),
            (self.allow_suicide, ALLOW_SUICIDE),
            (self.manual_ack, MANUAL_ACK),
            (self.discard_reply, DISCARD_REPLY),
            (self.cs_nodeid, CS_NODEID),
            (self.sync_call, SYNC_CALL),
            (self.timeout_updates, TIMEOUT_UPDATES),
            (self.report_only_success, REPORT_ONLY_SUCCESS),
        ];
        let mut bits = 0;
        let mut i = 0;
        while i < flags.len() {
            if flags[i].0 {
                bits |= flags[i].1;
            }
            i += 1;
        }
        bits
    }

    /// Decode a wire bitmask. Unknown bits are ignored.
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            verbose: bits & VERBOSE != 0,
            allow_suicide: bits & ALLOW_SUICIDE != 0,
            manual_ack: bits & MANUAL_ACK != 0,
            discard_reply: bits & DISCARD_REPLY != 0,
            cs_nodeid: bits & CS_NODEID != 0,
            sync_call: bits & SYNC_CALL != 0,
            timeout_updates: bits & TIMEOUT_UPDATES != 0,
            report_only_success: bits & REPORT_ONLY_SUCCESS != 0,
        }
    }
}

impl From<u32> for CallOptions {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

impl From<CallOptions> for u32 {
    fn from(options: CallOptions) -> Self {
        options.bits()
    }
}
