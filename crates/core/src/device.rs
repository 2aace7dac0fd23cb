//! User-agent classification.
//!
//! Parsing runs on the login path, so every function here is total: missing
//! or unrecognised fields degrade to [`UNKNOWN`] and the device type falls
//! back to [`DeviceType::Desktop`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "Unknown";
const UNKNOWN_BROWSER: &str = "Unknown Browser";
const UNKNOWN_OS: &str = "Unknown OS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for DeviceType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "mobile" => DeviceType::Mobile,
            "tablet" => DeviceType::Tablet,
            "desktop" => DeviceType::Desktop,
            _ => DeviceType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub device_type: DeviceType,
    pub browser: String,
    pub os: String,
    pub user_agent: String,
}

/// Derive a device descriptor from a user-agent string.
///
/// A non-blank `custom_name` wins over the synthesized display name, which is
/// `"<model> (<browser>)"` when a hardware model is recognisable and
/// `"<browser> on <os>"` otherwise.
pub fn parse_device(user_agent: &str, custom_name: Option<&str>) -> DeviceInfo {
    let parsed = ParsedAgent::parse(user_agent);

    let device_name = match custom_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => name.to_string(),
        None => parsed.display_name(),
    };

    DeviceInfo {
        device_name,
        device_type: parsed.kind.unwrap_or(DeviceType::Desktop),
        browser: parsed.browser.unwrap_or(UNKNOWN).to_string(),
        os: parsed.os.unwrap_or(UNKNOWN).to_string(),
        user_agent: user_agent.to_string(),
    }
}

#[derive(Debug, Default)]
struct ParsedAgent {
    browser: Option<&'static str>,
    os: Option<&'static str>,
    model: Option<String>,
    kind: Option<DeviceType>,
}

impl ParsedAgent {
    fn parse(user_agent: &str) -> Self {
        Self {
            browser: detect_browser(user_agent),
            os: detect_os(user_agent),
            model: detect_model(user_agent),
            kind: detect_kind(user_agent),
        }
    }

    fn display_name(&self) -> String {
        let browser = self.browser.unwrap_or(UNKNOWN_BROWSER);
        match &self.model {
            Some(model) => format!("{model} ({browser})"),
            None => format!("{browser} on {}", self.os.unwrap_or(UNKNOWN_OS)),
        }
    }
}

// Order matters: Chromium derivatives also advertise `Chrome/` and `Safari/`.
const BROWSER_MARKERS: &[(&str, &str)] = &[
    ("EdgiOS/", "Edge"),
    ("EdgA/", "Edge"),
    ("Edg/", "Edge"),
    ("Edge/", "Edge"),
    ("OPR/", "Opera"),
    ("Opera", "Opera"),
    ("SamsungBrowser/", "Samsung Internet"),
    ("FxiOS/", "Firefox"),
    ("Firefox/", "Firefox"),
    ("CriOS/", "Chrome"),
    ("Chromium/", "Chromium"),
    ("Chrome/", "Chrome"),
    ("MSIE ", "IE"),
    ("Trident/", "IE"),
];

const OS_MARKERS: &[(&str, &str)] = &[
    ("Windows Phone", "Windows Phone"),
    ("Windows", "Windows"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("iPod", "iOS"),
    ("Android", "Android"),
    ("CrOS", "Chrome OS"),
    ("Mac OS X", "Mac OS"),
    ("Macintosh", "Mac OS"),
    ("Linux", "Linux"),
];

const NON_HANDHELD_MARKERS: &[&str] = &["SMART-TV", "SmartTV", "PlayStation", "Xbox", "Nintendo"];

fn detect_browser(user_agent: &str) -> Option<&'static str> {
    if let Some((_, name)) = BROWSER_MARKERS
        .iter()
        .find(|(marker, _)| user_agent.contains(marker))
    {
        return Some(name);
    }
    let safari_like = user_agent.contains("Safari/")
        && (user_agent.contains("Version/") || user_agent.contains("Mobile/"));
    safari_like.then_some("Safari")
}

fn detect_os(user_agent: &str) -> Option<&'static str> {
    OS_MARKERS
        .iter()
        .find(|(marker, _)| user_agent.contains(marker))
        .map(|(_, name)| *name)
}

fn detect_kind(user_agent: &str) -> Option<DeviceType> {
    if NON_HANDHELD_MARKERS
        .iter()
        .any(|marker| user_agent.contains(marker))
    {
        return Some(DeviceType::Unknown);
    }
    let android = user_agent.contains("Android");
    if user_agent.contains("iPad")
        || user_agent.contains("Tablet")
        || (android && !user_agent.contains("Mobile"))
    {
        return Some(DeviceType::Tablet);
    }
    if ["iPhone", "iPod", "Mobile", "Windows Phone"]
        .iter()
        .any(|marker| user_agent.contains(marker))
    {
        return Some(DeviceType::Mobile);
    }
    None
}

fn detect_model(user_agent: &str) -> Option<String> {
    for apple in ["iPhone", "iPad", "iPod"] {
        if user_agent.contains(apple) {
            return Some(apple.to_string());
        }
    }

    let platform = platform_segment(user_agent)?;
    let mut tokens = platform.split(';').map(str::trim);
    tokens.find(|token| token.starts_with("Android"))?;
    let candidate = tokens.next()?;
    let model = candidate
        .split(" Build/")
        .next()
        .unwrap_or(candidate)
        .trim();
    is_plausible_model(model).then(|| model.to_string())
}

fn platform_segment(user_agent: &str) -> Option<&str> {
    let start = user_agent.find('(')? + 1;
    let end = user_agent[start..].find(')')? + start;
    Some(&user_agent[start..end])
}

fn is_plausible_model(token: &str) -> bool {
    if token.is_empty() || token.starts_with("rv:") || token == "wv" {
        return false;
    }
    // Reduced Chrome UAs report a placeholder model.
    if matches!(token, "K" | "U" | "Mobile" | "Tablet") {
        return false;
    }
    // Locale tokens such as `en-us` predate model tokens in old Android UAs.
    let bytes = token.as_bytes();
    let locale = bytes.len() == 5 && bytes[2] == b'-';
    !locale
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IPHONE_SAFARI: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPAD_SAFARI: &str = "Mozilla/5.0 (iPad; CPU OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1";
    const ANDROID_CHROME: &str = "Mozilla/5.0 (Linux; Android 13; SM-S911B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X710) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const ANDROID_REDUCED: &str = "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
    const WINDOWS_CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const WINDOWS_EDGE: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";
    const MAC_FIREFOX: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0";

    #[test]
    fn iphone_is_mobile_with_model_name() {
        let device = parse_device(IPHONE_SAFARI, None);
        assert_eq!(device.device_type, DeviceType::Mobile);
        assert_eq!(device.browser, "Safari");
        assert_eq!(device.os, "iOS");
        assert_eq!(device.device_name, "iPhone (Safari)");
        assert_eq!(device.user_agent, IPHONE_SAFARI);
    }

    #[test]
    fn ipad_is_tablet() {
        let device = parse_device(IPAD_SAFARI, None);
        assert_eq!(device.device_type, DeviceType::Tablet);
        assert_eq!(device.device_name, "iPad (Safari)");
    }

    #[test]
    fn android_phone_reports_hardware_model() {
        let device = parse_device(ANDROID_CHROME, None);
        assert_eq!(device.device_type, DeviceType::Mobile);
        assert_eq!(device.browser, "Chrome");
        assert_eq!(device.os, "Android");
        assert_eq!(device.device_name, "SM-S911B (Chrome)");
    }

    #[test]
    fn android_without_mobile_marker_is_tablet() {
        let device = parse_device(ANDROID_TABLET, None);
        assert_eq!(device.device_type, DeviceType::Tablet);
    }

    #[test]
    fn reduced_android_model_falls_back_to_browser_on_os() {
        let device = parse_device(ANDROID_REDUCED, None);
        assert_eq!(device.device_name, "Chrome on Android");
    }

    #[test]
    fn desktop_browsers_are_named_by_browser_and_os() {
        let chrome = parse_device(WINDOWS_CHROME, None);
        assert_eq!(chrome.device_type, DeviceType::Desktop);
        assert_eq!(chrome.device_name, "Chrome on Windows");

        let edge = parse_device(WINDOWS_EDGE, None);
        assert_eq!(edge.browser, "Edge");

        let firefox = parse_device(MAC_FIREFOX, None);
        assert_eq!(firefox.browser, "Firefox");
        assert_eq!(firefox.os, "Mac OS");
        assert_eq!(firefox.device_name, "Firefox on Mac OS");
    }

    #[test]
    fn custom_name_overrides_synthesized_name() {
        let device = parse_device(WINDOWS_CHROME, Some("  Work laptop "));
        assert_eq!(device.device_name, "Work laptop");

        let blank = parse_device(WINDOWS_CHROME, Some("   "));
        assert_eq!(blank.device_name, "Chrome on Windows");
    }

    #[test]
    fn unrecognised_agents_degrade_to_unknown() {
        let empty = parse_device("", None);
        assert_eq!(empty.device_type, DeviceType::Desktop);
        assert_eq!(empty.browser, UNKNOWN);
        assert_eq!(empty.os, UNKNOWN);
        assert_eq!(empty.device_name, "Unknown Browser on Unknown OS");

        let curl = parse_device("curl/8.4.0", None);
        assert_eq!(curl.device_type, DeviceType::Desktop);
        assert_eq!(curl.browser, UNKNOWN);
    }

    #[test]
    fn consoles_and_tvs_are_unknown_device_type() {
        let device = parse_device(
            "Mozilla/5.0 (PlayStation; PlayStation 5/2.26) AppleWebKit/605.1.15 (KHTML, like Gecko)",
            None,
        );
        assert_eq!(device.device_type, DeviceType::Unknown);
    }

    #[test]
    fn device_type_labels_round_trip_and_degrade() {
        for kind in [DeviceType::Mobile, DeviceType::Tablet, DeviceType::Desktop] {
            assert_eq!(DeviceType::from(kind.as_str()), kind);
        }
        assert_eq!(DeviceType::from("smarttv"), DeviceType::Unknown);
    }

    proptest! {
        #[test]
        fn parsing_never_panics_and_names_are_never_empty(agent in ".{0,256}") {
            let device = parse_device(&agent, None);
            prop_assert!(!device.device_name.is_empty());
            prop_assert!(!device.browser.is_empty());
            prop_assert!(!device.os.is_empty());
        }
    }
}
