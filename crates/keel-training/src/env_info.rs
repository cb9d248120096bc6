//! Host description logged at launch and stored in the run metadata.

use std::process::Command;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment facts as ordered `(name, value)` pairs.
#[must_use]
pub fn collect_env() -> Vec<(&'static str, String)> {
    let cpus = std::thread::available_parallelism().map_or_else(|_| "unknown".to_string(), |n| n.to_string());
    vec![
        ("OS", std::env::consts::OS.to_string()),
        ("Arch", std::env::consts::ARCH.to_string()),
        ("CPU cores", cpus),
        ("keel", version_with_git_hash()),
        (
            "CUDA_VISIBLE_DEVICES",
            std::env::var("CUDA_VISIBLE_DEVICES").unwrap_or_else(|_| "not set".to_string()),
        ),
    ]
}

/// One `name: value` line per entry.
#[must_use]
pub fn format_env_info(entries: &[(&str, String)]) -> String {
    entries
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First seven characters of `git rev-parse HEAD`, if the launch directory
/// is inside a repository.
#[must_use]
pub fn short_git_hash() -> Option<String> {
    let output = Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?;
    let hash = hash.trim();
    (hash.len() >= 7).then(|| hash[..7].to_string())
}

/// `<crate version>+<short git hash>`, e.g. `0.1.0+1a2b3c4`.
#[must_use]
pub fn version_with_git_hash() -> String {
    format!("{VERSION}+{}", short_git_hash().unwrap_or_else(|| "unknown".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_env_info() {
        let text = format_env_info(&[("OS", "linux".to_string()), ("CPU cores", "8".to_string())]);
        assert_eq!(text, "OS: linux\nCPU cores: 8");
    }

    #[test]
    fn test_version_carries_crate_version() {
        let version = version_with_git_hash();
        assert!(version.starts_with(&format!("{VERSION}+")));
        let hash = version.split('+').nth(1).unwrap();
        assert!(hash == "unknown" || hash.len() == 7);
    }

    #[test]
    fn test_collect_env_has_keel_entry() {
        let entries = collect_env();
        assert!(entries.iter().any(|(name, _)| *name == "keel"));
    }
}
