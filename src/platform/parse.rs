//! Parsers for the text output of OS configuration tools
#![cfg_attr(not(any(target_os = "macos", windows)), allow(dead_code))]

/// Interface of the default route from `route -n get default`
pub fn default_route_interface(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("interface:"))
        .map(|iface| iface.trim().to_string())
        .filter(|iface| !iface.is_empty())
}

/// Network service owning `device` in `networksetup -listallhardwareports`
pub fn hardware_port_for_device(output: &str, device: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let wanted = format!("Device: {}", device);

    let device_line = lines.iter().position(|line| *line == wanted)?;
    lines[..device_line]
        .iter()
        .rev()
        .find_map(|line| line.strip_prefix("Hardware Port:"))
        .map(|port| port.trim().to_string())
}

/// `networksetup -getwebproxy <service>` reports the proxy as enabled
pub fn web_proxy_enabled(output: &str) -> bool {
    output.lines().any(|line| line.trim() == "Enabled: Yes")
}

/// `reg query ... /v ProxyEnable` shows a value of 1
pub fn registry_proxy_enabled(output: &str) -> bool {
    output
        .lines()
        .filter(|line| line.contains("ProxyEnable"))
        .any(|line| line.split_whitespace().last() == Some("0x1"))
}

fn normalize_thumbprint(raw: &str) -> Option<String> {
    let thumbprint: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    if !thumbprint.is_empty() && thumbprint.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(thumbprint)
    } else {
        None
    }
}

/// SHA1 thumbprint from `certutil -hashfile <file> SHA1` (second line)
pub fn certutil_hashfile_thumbprint(output: &str) -> Option<String> {
    output.lines().nth(1).and_then(normalize_thumbprint)
}

/// Every `Cert Hash(sha1):` entry in `certutil -store` output
pub fn store_thumbprints(output: &str) -> Vec<String> {
    const MARKER: &str = "cert hash(sha1):";

    output
        .lines()
        .filter_map(|line| {
            let lower = line.to_lowercase();
            let start = lower.find(MARKER)? + MARKER.len();
            normalize_thumbprint(&lower[start..])
        })
        .collect()
}
