//! Backend detection.

use super::BackendKind;

/// Information about a backend variant.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Backend variant.
    pub kind: BackendKind,
    /// Human-readable name.
    pub name: &'static str,
    /// Compiled in.
    pub enabled: bool,
    /// Compiled in and a capable device was found.
    pub available: bool,
    /// Description.
    pub description: &'static str,
}

/// Probe every variant, in driver run order.
pub fn detect_backends() -> Vec<BackendInfo> {
    BackendKind::ALL
        .into_iter()
        .map(|kind| {
            let enabled = kind.is_enabled();
            BackendInfo {
                kind,
                name: kind.api_name(),
                enabled,
                available: enabled && kind.is_available(),
                description: match kind {
                    BackendKind::Stream => "stream: OpenCL images, host-pointer copy, blocking read",
                    BackendKind::RasterCompute => "raster: wgpu compute pass, copy-out readback",
                    BackendKind::Explicit => "explicit: Vulkan staging images, barriers and fence",
                },
            }
        })
        .collect()
}

/// Get description of all backends.
pub fn describe_backends() -> String {
    let mut desc = String::new();

    for info in detect_backends() {
        let status = if info.available { "+" } else { "-" };
        desc.push_str(&format!("[{}] {}: {}", status, info.name, info.description));
        if !info.enabled {
            desc.push_str(&format!(" (built without '{}')", info.kind.feature()));
        }
        desc.push('\n');
    }

    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_lists_all_variants() {
        let backends = detect_backends();
        assert_eq!(backends.len(), 3);
        assert_eq!(backends[0].kind, BackendKind::Stream);
        assert!(backends.iter().all(|b| b.enabled || !b.available));
    }

    #[test]
    fn test_describe_backends() {
        let desc = describe_backends();
        assert!(desc.contains("vulkan"));
        assert!(desc.contains("opencl"));
        assert_eq!(desc.lines().count(), 3);
    }
}
