//! Host fingerprint
//!
//! A stable SHA-256 hash of host identity fields, used by the control
//! plane to de-duplicate node registrations. Any field that cannot be
//! read contributes an empty string; the hash is always produced.

use sha2::{Digest, Sha256};
use sysinfo::{Networks, System};

/// Build the host fingerprint.
pub fn generate() -> String {
    let mut info = String::new();

    info.push_str(&System::host_name().unwrap_or_default());
    info.push_str(&System::name().unwrap_or_default());
    info.push_str(&System::os_version().unwrap_or_default());

    let sys = System::new_all();
    if let Some(cpu) = sys.cpus().first() {
        info.push_str(cpu.brand());
    }
    info.push_str(&sys.total_memory().to_string());
    info.push_str(&first_mac_address());
    info.push_str(std::env::consts::OS);
    info.push_str(std::env::consts::ARCH);

    hex::encode(Sha256::digest(info.as_bytes()))
}

/// MAC address of the first non-loopback interface, or empty.
fn first_mac_address() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut entries: Vec<_> = networks.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (name, data) in entries {
        if name.starts_with("lo") {
            continue;
        }
        let mac = data.mac_address().to_string();
        if mac != "00:00:00:00:00:00" {
            return mac;
        }
    }
    String::new()
}
