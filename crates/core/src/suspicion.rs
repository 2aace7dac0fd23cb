//! Advisory anomaly scoring for logins.
//!
//! A login is compared against the user's recent sessions (revoked and
//! expired ones included) on three independent signals: device type,
//! country and browser. Two or more novel signals flag the login. A user
//! with no history is never flagged.

use std::fmt;

use crate::{DeviceInfo, Location, Session};

pub const SUSPICION_THRESHOLD: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoveltySignal {
    DeviceType,
    Location(String),
    Browser,
}

impl fmt::Display for NoveltySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoveltySignal::DeviceType => f.write_str("new device type"),
            NoveltySignal::Location(country) => write!(f, "new location ({country})"),
            NoveltySignal::Browser => f.write_str("new browser"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuspicionVerdict {
    pub is_suspicious: bool,
    pub reason: Option<String>,
}

impl SuspicionVerdict {
    pub fn clear() -> Self {
        Self::default()
    }
}

/// Score a candidate login against prior sessions.
///
/// `location` is the already-resolved location of the candidate IP; the
/// country signal is only evaluated when it is present.
pub fn score(
    device: &DeviceInfo,
    location: Option<&Location>,
    history: &[Session],
) -> SuspicionVerdict {
    if history.is_empty() {
        return SuspicionVerdict::clear();
    }

    let signals = novelty_signals(device, location, history);
    if signals.len() < SUSPICION_THRESHOLD {
        return SuspicionVerdict::clear();
    }

    let reason = signals
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    SuspicionVerdict {
        is_suspicious: true,
        reason: Some(reason),
    }
}

pub fn novelty_signals(
    device: &DeviceInfo,
    location: Option<&Location>,
    history: &[Session],
) -> Vec<NoveltySignal> {
    let mut signals = Vec::with_capacity(3);

    if !history
        .iter()
        .any(|session| session.device.device_type == device.device_type)
    {
        signals.push(NoveltySignal::DeviceType);
    }

    if let Some(location) = location {
        let seen_country = history.iter().any(|session| {
            session
                .location
                .as_ref()
                .is_some_and(|previous| previous.country == location.country)
        });
        if !seen_country {
            signals.push(NoveltySignal::Location(location.country.clone()));
        }
    }

    if !history
        .iter()
        .any(|session| session.device.browser == device.browser)
    {
        signals.push(NoveltySignal::Browser);
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_device, NewSession};
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    const WINDOWS_CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const WINDOWS_FIREFOX: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const IPHONE_CHROME: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/120.0.6099.119 Mobile/15E148 Safari/604.1";
    const IPHONE_SAFARI: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

    fn us() -> Location {
        Location::new("US", "CA", "San Francisco", "America/Los_Angeles")
    }

    fn de() -> Location {
        Location::new("DE", "BE", "Berlin", "Europe/Berlin")
    }

    fn prior(user_agent: &str, location: Option<Location>) -> Session {
        NewSession {
            user_id: Uuid::new_v4(),
            secret_hash: String::new(),
            device: parse_device(user_agent, None),
            ip_address: "203.0.113.1".into(),
            location,
            ttl: Duration::days(7),
            is_suspicious: false,
            suspicion_reason: None,
        }
        .into_session(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn first_login_is_never_suspicious() {
        let device = parse_device(IPHONE_SAFARI, None);
        let verdict = score(&device, Some(&de()), &[]);
        assert_eq!(verdict, SuspicionVerdict::clear());
    }

    #[test]
    fn single_novel_signal_is_tolerated() {
        let history = vec![prior(WINDOWS_CHROME, Some(us()))];
        let device = parse_device(WINDOWS_FIREFOX, None);
        let verdict = score(&device, Some(&us()), &history);
        assert!(!verdict.is_suspicious);
        assert!(verdict.reason.is_none());
    }

    #[test]
    fn two_novel_signals_flag_the_login() {
        let history = vec![prior(WINDOWS_CHROME, Some(us()))];
        let device = parse_device(IPHONE_CHROME, None);
        let verdict = score(&device, Some(&de()), &history);
        assert!(verdict.is_suspicious);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("new device type, new location (DE)")
        );
    }

    #[test]
    fn all_three_signals_are_listed_in_order() {
        let history = vec![prior(WINDOWS_CHROME, Some(us()))];
        let device = parse_device(IPHONE_SAFARI, None);
        let verdict = score(&device, Some(&de()), &history);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("new device type, new location (DE), new browser")
        );
    }

    #[test]
    fn unresolvable_location_does_not_count_as_novel() {
        let history = vec![prior(WINDOWS_CHROME, Some(us()))];
        let device = parse_device(IPHONE_CHROME, None);
        let verdict = score(&device, None, &history);
        assert!(!verdict.is_suspicious);
    }

    #[test]
    fn history_without_locations_makes_any_country_novel() {
        let history = vec![prior(WINDOWS_CHROME, None)];
        let device = parse_device(WINDOWS_FIREFOX, None);
        let verdict = score(&device, Some(&us()), &history);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("new location (US), new browser")
        );
    }

    proptest! {
        #[test]
        fn flagged_exactly_when_two_or_more_signals(
            new_type in any::<bool>(),
            new_country in any::<bool>(),
            new_browser in any::<bool>(),
        ) {
            let history = vec![prior(WINDOWS_CHROME, Some(us()))];
            let agent = match (new_type, new_browser) {
                (false, false) => WINDOWS_CHROME,
                (false, true) => WINDOWS_FIREFOX,
                (true, false) => IPHONE_CHROME,
                (true, true) => IPHONE_SAFARI,
            };
            let location = if new_country { de() } else { us() };
            let device = parse_device(agent, None);
            let expected = [new_type, new_country, new_browser].iter().filter(|flag| **flag).count();
            let verdict = score(&device, Some(&location), &history);
            prop_assert_eq!(verdict.is_suspicious, expected >= SUSPICION_THRESHOLD);
            prop_assert_eq!(verdict.reason.is_some(), verdict.is_suspicious);
        }
    }
}
