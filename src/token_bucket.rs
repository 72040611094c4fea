//! Token bucket decision procedure.
//!
//! The same procedure exists twice: [`evaluate`] in Rust, used by the
//! in-memory store, and [`TAKE_SCRIPT`] in Lua, which Redis runs atomically
//! against a bucket's two state keys. Both must stay in lockstep.

use crate::service_config::BucketConfig;
use std::time::Duration;

/// Suffix of the key holding the nanosecond timestamp at which the bucket is out of debt.
pub const TOKENS_NEXT_AVAILABLE_SUFFIX: &str = "TNA";
/// Suffix of the key holding the currently accumulated tokens.
pub const ACCUMULATED_TOKENS_SUFFIX: &str = "AT";

/// Returned by the script when the request is not admitted.
pub const REJECTED: i64 = -1;

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// KEYS[1] = tokens-next-available key, KEYS[2] = accumulated-tokens key.
/// ARGV = now, nanos between tokens, bucket size, requested, max wait nanos,
/// max idle millis, max debt nanos.
pub const TAKE_SCRIPT: &str = r#"
local tna = tonumber(redis.call("GET", KEYS[1]))
if not tna then
    tna = 0
end

local size = tonumber(ARGV[3])
local accumulated = tonumber(redis.call("GET", KEYS[2]))
if not accumulated then
    accumulated = size
end

local now = tonumber(ARGV[1])
local nanosBetweenTokens = tonumber(ARGV[2])
local requested = tonumber(ARGV[4])
local maxWaitNanos = tonumber(ARGV[5])
local maxIdleMillis = tonumber(ARGV[6])
local maxDebtNanos = tonumber(ARGV[7])

if now > tna then
    local fresh = math.floor((now - tna) / nanosBetweenTokens)
    accumulated = math.min(size, accumulated + fresh)
    tna = now
end

local waitNanos = tna - now
local used = math.min(accumulated, requested)
local deficit = requested - used

tna = tna + deficit * nanosBetweenTokens
accumulated = accumulated - used

if (tna - now > maxDebtNanos) or (waitNanos > 0 and waitNanos > maxWaitNanos) then
    return -1
end

if maxIdleMillis > 0 then
    redis.call("SET", KEYS[1], tna, "PX", maxIdleMillis)
    redis.call("SET", KEYS[2], math.floor(accumulated), "PX", maxIdleMillis)
else
    redis.call("SET", KEYS[1], tna)
    redis.call("SET", KEYS[2], math.floor(accumulated))
end

return waitNanos
"#;

/// Backing store key pair for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub tokens_next_available: String,
    pub accumulated_tokens: String,
}

impl BucketKeys {
    pub fn new(namespace: &str, bucket: &str) -> Self {
        Self {
            tokens_next_available: state_key(namespace, bucket, TOKENS_NEXT_AVAILABLE_SUFFIX),
            accumulated_tokens: state_key(namespace, bucket, ACCUMULATED_TOKENS_SUFFIX),
        }
    }

    pub fn as_array(&self) -> [&str; 2] {
        [&self.tokens_next_available, &self.accumulated_tokens]
    }
}

pub fn state_key(namespace: &str, bucket: &str, suffix: &str) -> String {
    format!("{}:{}:{}", namespace, bucket, suffix)
}

/// Bucket-level parameters, derived once when the bucket is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    pub nanos_between_tokens: i64,
    pub max_tokens_to_accumulate: i64,
    pub max_idle_millis: i64,
    pub max_debt_nanos: i64,
}

impl BucketParams {
    pub fn from_config(config: &BucketConfig) -> Self {
        Self {
            nanos_between_tokens: (NANOS_PER_SECOND / config.fill_rate.max(1)).max(1),
            max_tokens_to_accumulate: config.size,
            max_idle_millis: config.max_idle_millis.max(0),
            max_debt_nanos: config.max_debt_millis.saturating_mul(NANOS_PER_MILLI),
        }
    }

    pub fn take_args(&self, current_time_nanos: i64, requested: i64, max_wait: Duration) -> TakeArgs {
        TakeArgs {
            current_time_nanos,
            nanos_between_tokens: self.nanos_between_tokens,
            max_tokens_to_accumulate: self.max_tokens_to_accumulate,
            requested,
            max_wait_nanos: i64::try_from(max_wait.as_nanos()).unwrap_or(i64::MAX),
            max_idle_millis: self.max_idle_millis,
            max_debt_nanos: self.max_debt_nanos,
        }
    }
}

/// Inputs of a single invocation, in script ARGV order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeArgs {
    pub current_time_nanos: i64,
    pub nanos_between_tokens: i64,
    pub max_tokens_to_accumulate: i64,
    pub requested: i64,
    pub max_wait_nanos: i64,
    pub max_idle_millis: i64,
    pub max_debt_nanos: i64,
}

impl TakeArgs {
    pub fn to_argv(&self) -> [i64; 7] {
        [
            self.current_time_nanos,
            self.nanos_between_tokens,
            self.max_tokens_to_accumulate,
            self.requested,
            self.max_wait_nanos,
            self.max_idle_millis,
            self.max_debt_nanos,
        ]
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens_next_available_nanos: i64,
    pub accumulated_tokens: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The new state must be written; the caller waits `wait_nanos` (may be <= 0).
    Admitted { wait_nanos: i64, state: BucketState },
    /// Nothing is written.
    Rejected,
}

impl Decision {
    /// Script return value for this decision.
    pub fn script_result(&self) -> i64 {
        match self {
            Decision::Admitted { wait_nanos, .. } => *wait_nanos,
            Decision::Rejected => REJECTED,
        }
    }
}

/// Runs the decision against the stored cells. Absent cells take their defaults.
pub fn evaluate(
    tokens_next_available: Option<i64>,
    accumulated: Option<i64>,
    args: &TakeArgs,
) -> Decision {
    let now = args.current_time_nanos;
    let nanos_between_tokens = args.nanos_between_tokens.max(1);
    let size = args.max_tokens_to_accumulate;

    let mut tna = tokens_next_available.unwrap_or(0);
    let mut accumulated = accumulated.unwrap_or(size);

    if now > tna {
        let fresh = (now - tna) / nanos_between_tokens;
        accumulated = size.min(accumulated.saturating_add(fresh));
        tna = now;
    }

    let wait_nanos = tna - now;
    let used = accumulated.min(args.requested);
    let deficit = args.requested - used;

    tna = tna.saturating_add(deficit.saturating_mul(nanos_between_tokens));
    accumulated -= used;

    if tna - now > args.max_debt_nanos || (wait_nanos > 0 && wait_nanos > args.max_wait_nanos) {
        return Decision::Rejected;
    }

    Decision::Admitted {
        wait_nanos,
        state: BucketState {
            tokens_next_available_nanos: tna,
            accumulated_tokens: accumulated,
        },
    }
}

/// Converts a script result into `(wait, admitted)`.
pub fn interpret(result: i64) -> (Duration, bool) {
    if result < 0 {
        // Rejected; an admitted request never returns a negative wait since
        // the refill step moves the next-available timestamp up to now.
        return (Duration::ZERO, false);
    }
    (Duration::from_nanos(result as u64), true)
}
