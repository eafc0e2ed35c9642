use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub hex: String,
    pub components: Vec<String>,
}

pub fn sha256_hex(s: &str) -> String {
    sha256_bytes_hex(s.as_bytes())
}

pub fn sha256_bytes_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Computes the deterministic identity of a (metric, dataset group) pair.
///
/// `selectors` are `source_type:facet=value` entries; they are sorted here so
/// callers do not have to care about requirement or group-by ordering.
pub fn execution_identity(
    provider_slug: &str,
    metric_slug: &str,
    metric_version: &str,
    selectors: &[String],
) -> Fingerprint {
    let mut parts = Vec::new();

    parts.push(format!("provider={provider_slug}"));
    parts.push(format!("metric={metric_slug}"));
    parts.push(format!("version={metric_version}"));

    let mut sorted = selectors.to_vec();
    sorted.sort();
    parts.push(format!("selectors={}", sorted.join(",")));

    let raw = parts.join("\n");
    let hex = sha256_hex(&raw);

    Fingerprint {
        hex,
        components: parts,
    }
}
