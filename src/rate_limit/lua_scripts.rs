/// Lua script for the weighted two-bucket sliding window check.
///
/// Reads both bucket counters, computes the weighted estimate, and only
/// increments the current bucket when the request is admitted. Running this
/// as one script keeps the read/compare/increment/expire sequence atomic on
/// the Redis server, so concurrent checks cannot interleave.
///
/// KEYS[1] = current window bucket key
/// KEYS[2] = previous window bucket key
/// ARGV[1] = window duration (milliseconds)
/// ARGV[2] = elapsed time in the current bucket (milliseconds)
/// ARGV[3] = rate limit
///
/// Returns: {allowed (0/1), current_count, previous_count}
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local window_ms = tonumber(ARGV[1])
local elapsed_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

local current_count = tonumber(redis.call("GET", current_key) or "0")
local previous_count = tonumber(redis.call("GET", previous_key) or "0")

-- Weighted count: previous window's remaining proportion + current count
local weight = 1 - (elapsed_ms / window_ms)
local estimated = math.floor(previous_count * weight) + current_count

if estimated >= limit then
    return {0, current_count, previous_count}
end

-- The bucket must outlive its own window so it can serve as the previous
-- bucket during the next one.
local new_count = redis.call("INCR", current_key)
if new_count == 1 then
    redis.call("PEXPIRE", current_key, window_ms * 2)
end

return {1, new_count, previous_count}
"#;

/// Lua script for a plain windowed increment.
///
/// KEYS[1] = the rate limit key
/// ARGV[1] = window duration (milliseconds)
///
/// Returns the count after incrementing.
pub const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])

local current = redis.call("INCR", key)

-- Only set expiry on first increment so subsequent increments
-- do not reset the TTL.
if current == 1 then
    redis.call("PEXPIRE", key, window_ms)
end

return current
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_valid() {
        // Verify the scripts contain the expected commands
        assert!(SLIDING_WINDOW_SCRIPT.contains("GET"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("INCR"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("math.floor"));

        assert!(INCREMENT_SCRIPT.contains("INCR"));
        assert!(INCREMENT_SCRIPT.contains("PEXPIRE"));
    }
}
