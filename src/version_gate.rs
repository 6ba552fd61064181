//! Minimum-version policy for companion services.
//!
//! Versions are compared component-wise (major, minor, patch). Each
//! component is read as its first run of digits, so `v1.3`, `1.3.0-beta`
//! and an epoch prefix such as `2:1.3.0` all reduce to plain numbers.
//! Missing components count as zero.

/// Parse a version string into `[major, minor, patch]`
pub fn parse_version(version: &str) -> [u64; 3] {
    let version = version.trim();
    let version = version
        .rsplit_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(version);

    let mut parts = [0u64; 3];
    for (slot, component) in parts.iter_mut().zip(version.split('.')) {
        let digits: String = component
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        *slot = digits.parse().unwrap_or(0);
    }
    parts
}

/// Whether `target` is at least `minimum`
pub fn satisfies(target: &str, minimum: &str) -> bool {
    parse_version(target) >= parse_version(minimum)
}
