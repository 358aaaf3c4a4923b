//! Kubernetes resource quantity validation.
//!
//! Requested pod resources are validated before any cluster call: both the
//! limit and the request must use Kubernetes quantity syntax, and the limit
//! must not be below the request once both are normalized to a common base
//! (millicores-as-cores for CPU, bytes for memory).

use std::sync::LazyLock;

use regex::Regex;

/// Matches a CPU quantity: a bare integer, a decimal, or a milli-suffixed
/// integer.
static CPU_QUANTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+m$|^\d+(\.\d+)?$").expect("regex should compile"));

/// Matches a memory quantity: a bare integer, scientific notation, or an
/// integer with a unit suffix.
static MEMORY_QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+$|^\d+e\d+$|^\d+(Ei|Pi|Ti|Gi|Mi|Ki|E|P|T|G|M|k|m)$")
        .expect("regex should compile")
});

/// The memory unit suffix table.
///
/// Two-letter suffixes are listed first so suffix scanning finds `Gi`
/// before `G`. The lowercase `m` multiplier of 1000 is inherited from the
/// node's historical unit table.
const MEMORY_UNITS: &[(&str, f64)] = &[
    ("Ei", 1152921504606846976.0), // 2^60
    ("Pi", 1125899906842624.0),    // 2^50
    ("Ti", 1099511627776.0),       // 2^40
    ("Gi", 1073741824.0),          // 2^30
    ("Mi", 1048576.0),             // 2^20
    ("Ki", 1024.0),                // 2^10
    ("E", 1e18),
    ("P", 1e15),
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("m", 1e3),
];

/// Represents a resource quantity validation error.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// A CPU quantity did not match the expected syntax.
    #[error("Cpu resource value {0} is invalid")]
    InvalidCpu(String),
    /// A memory quantity did not match the expected syntax.
    #[error("Memory resource value {0} is invalid")]
    InvalidMemory(String),
    /// The limit was below the request.
    #[error("{resource} limit {limit} cannot be lower than the request {request}")]
    LimitBelowRequest {
        /// The resource kind, for the error message.
        resource: &'static str,
        /// The offending limit.
        limit: String,
        /// The request it fell below.
        request: String,
    },
}

/// The result type for quantity validation.
pub type Result<T> = std::result::Result<T, Error>;

/// Converts a CPU quantity to cores.
pub fn convert_cpu_to_base(value: &str) -> Result<f64> {
    if !CPU_QUANTITY.is_match(value) {
        return Err(Error::InvalidCpu(value.to_string()));
    }

    if let Some(millis) = value.strip_suffix('m') {
        let millis: f64 = millis
            .parse()
            .map_err(|_| Error::InvalidCpu(value.to_string()))?;
        return Ok(millis / 1000.0);
    }

    value.parse().map_err(|_| Error::InvalidCpu(value.to_string()))
}

/// Converts a memory quantity to bytes.
pub fn convert_memory_to_base(value: &str) -> Result<f64> {
    if !MEMORY_QUANTITY.is_match(value) {
        return Err(Error::InvalidMemory(value.to_string()));
    }

    if let Some((mantissa, exponent)) = value.split_once('e') {
        let mantissa: f64 = mantissa
            .parse()
            .map_err(|_| Error::InvalidMemory(value.to_string()))?;
        let exponent: i32 = exponent
            .parse()
            .map_err(|_| Error::InvalidMemory(value.to_string()))?;
        return Ok(mantissa * 10f64.powi(exponent));
    }

    for (suffix, multiplier) in MEMORY_UNITS {
        if let Some(number) = value.strip_suffix(suffix) {
            let number: f64 = number
                .parse()
                .map_err(|_| Error::InvalidMemory(value.to_string()))?;
            return Ok(number * multiplier);
        }
    }

    value
        .parse()
        .map_err(|_| Error::InvalidMemory(value.to_string()))
}

/// Validates a CPU limit/request pair.
pub fn validate_cpu_resources(limit: Option<&str>, request: Option<&str>) -> Result<()> {
    let limit = limit.map(convert_cpu_to_base).transpose()?;
    let request = request.map(convert_cpu_to_base).transpose()?;

    if let (Some(limit), Some(request)) = (limit, request) {
        if limit < request {
            return Err(Error::LimitBelowRequest {
                resource: "Cpu",
                limit: format!("{limit}"),
                request: format!("{request}"),
            });
        }
    }

    Ok(())
}

/// Validates a memory limit/request pair.
pub fn validate_memory_resources(limit: Option<&str>, request: Option<&str>) -> Result<()> {
    let limit = limit.map(convert_memory_to_base).transpose()?;
    let request = request.map(convert_memory_to_base).transpose()?;

    if let (Some(limit), Some(request)) = (limit, request) {
        if limit < request {
            return Err(Error::LimitBelowRequest {
                resource: "Memory",
                limit: format!("{limit}"),
                request: format!("{request}"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities_normalize_to_cores() {
        assert_eq!(convert_cpu_to_base("100m").unwrap(), 0.1);
        assert_eq!(convert_cpu_to_base("0.1").unwrap(), 0.1);
        assert_eq!(convert_cpu_to_base("1").unwrap(), 1.0);
    }

    #[test]
    fn cpu_syntax_is_enforced() {
        assert!(matches!(convert_cpu_to_base("abc"), Err(Error::InvalidCpu(_))));
        assert!(matches!(convert_cpu_to_base("100mi"), Err(Error::InvalidCpu(_))));
        assert!(matches!(convert_cpu_to_base(""), Err(Error::InvalidCpu(_))));
    }

    #[test]
    fn memory_quantities_normalize_to_bytes() {
        assert_eq!(convert_memory_to_base("1Gi").unwrap(), (1u64 << 30) as f64);
        assert_eq!(convert_memory_to_base("1G").unwrap(), 1e9);
        assert_eq!(convert_memory_to_base("129e6").unwrap(), 129_000_000.0);
        assert_eq!(convert_memory_to_base("512Mi").unwrap(), 512.0 * 1048576.0);
        assert_eq!(convert_memory_to_base("128").unwrap(), 128.0);
    }

    #[test]
    fn memory_syntax_is_enforced() {
        assert!(matches!(
            convert_memory_to_base("1Gib"),
            Err(Error::InvalidMemory(_))
        ));
        assert!(matches!(
            convert_memory_to_base("lots"),
            Err(Error::InvalidMemory(_))
        ));
    }

    #[test]
    fn cpu_limit_must_cover_request() {
        assert!(matches!(
            validate_cpu_resources(Some("100m"), Some("200m")),
            Err(Error::LimitBelowRequest { resource: "Cpu", .. })
        ));
        validate_cpu_resources(Some("200m"), Some("0.2")).unwrap();
        validate_cpu_resources(Some("1"), Some("500m")).unwrap();
        validate_cpu_resources(None, Some("500m")).unwrap();
    }

    #[test]
    fn memory_limit_must_cover_request_across_units() {
        assert!(matches!(
            validate_memory_resources(Some("1G"), Some("1Gi")),
            Err(Error::LimitBelowRequest {
                resource: "Memory",
                ..
            })
        ));
        validate_memory_resources(Some("1Gi"), Some("1G")).unwrap();
        validate_memory_resources(Some("129e6"), Some("128M")).unwrap();
    }
}
