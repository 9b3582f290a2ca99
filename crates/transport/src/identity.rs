//! Client identity validation.

/// Checks a presented identity against the expected value.
///
/// Uses constant-time comparison.
pub fn validate_identity(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}
