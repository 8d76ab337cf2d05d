//! Stable machine identifier.
//!
//! Prefers OS-provided hardware/system ids and falls back to a deterministic
//! hash over the OS name, the sorted non-loopback MAC addresses and the
//! hostname.

use sha2::{Digest, Sha256};

/// Return a stable machine identifier, lowercased and trimmed.
pub fn machine_id() -> String {
    let id = machine_id_from_os();
    let id = id.trim();
    if !id.is_empty() {
        return id.to_lowercase();
    }
    fallback_machine_id()
}

#[cfg(target_os = "macos")]
fn machine_id_from_os() -> String {
    let output = match std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
    {
        Ok(output) if output.status.success() => output.stdout,
        _ => return String::new(),
    };
    let text = String::from_utf8_lossy(&output);
    for line in text.lines() {
        if !line.contains("IOPlatformUUID") {
            continue;
        }
        // "IOPlatformUUID" = "XXXXXXXX-...."
        let mut parts = line.split('"').skip(3);
        if let Some(uuid) = parts.next() {
            return uuid.to_string();
        }
    }
    String::new()
}

#[cfg(target_os = "linux")]
fn machine_id_from_os() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(content) = std::fs::read_to_string(path) {
            let id = content.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    String::new()
}

#[cfg(target_os = "windows")]
fn machine_id_from_os() -> String {
    let output = match std::process::Command::new("reg")
        .args([
            "query",
            r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ])
        .output()
    {
        Ok(output) if output.status.success() => output.stdout,
        _ => return String::new(),
    };
    let text = String::from_utf8_lossy(&output);
    for line in text.lines() {
        let line = line.trim();
        if !line.to_lowercase().starts_with("machineguid") {
            continue;
        }
        if let Some(value) = line.split_whitespace().last() {
            return value.to_string();
        }
    }
    String::new()
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn machine_id_from_os() -> String {
    String::new()
}

/// Deterministic fallback: `fallback-` plus the first 16 bytes of
/// SHA-256 over `os|sorted macs|hostname`, hex-encoded.
fn fallback_machine_id() -> String {
    let mut parts = vec![std::env::consts::OS.to_string()];

    let mut macs = non_loopback_macs();
    macs.sort();
    parts.push(macs.join(","));

    if let Some(hostname) = hostname() {
        parts.push(hostname.trim().to_lowercase());
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("fallback-{hex}")
}

#[cfg(target_os = "linux")]
fn non_loopback_macs() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut macs = Vec::new();
    for entry in entries.flatten() {
        if entry.file_name() == "lo" {
            continue;
        }
        if let Ok(address) = std::fs::read_to_string(entry.path().join("address")) {
            let mac = address.trim().to_lowercase();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                macs.push(mac);
            }
        }
    }
    macs
}

#[cfg(not(target_os = "linux"))]
fn non_loopback_macs() -> Vec<String> {
    Vec::new()
}

fn hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME")
        && !name.trim().is_empty()
    {
        return Some(name);
    }
    if let Ok(name) = std::env::var("COMPUTERNAME")
        && !name.trim().is_empty()
    {
        return Some(name);
    }
    let output = std::process::Command::new("hostname").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_id_is_non_empty_and_lowercase() {
        let id = machine_id();
        assert!(!id.is_empty());
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn test_machine_id_is_stable() {
        assert_eq!(machine_id(), machine_id());
    }

    #[test]
    fn test_fallback_shape() {
        let id = fallback_machine_id();
        assert!(id.starts_with("fallback-"));
        // 16 bytes hex-encoded.
        assert_eq!(id.len(), "fallback-".len() + 32);
        assert!(
            id["fallback-".len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        );
    }

    #[test]
    fn test_fallback_is_deterministic() {
        assert_eq!(fallback_machine_id(), fallback_machine_id());
    }
}
