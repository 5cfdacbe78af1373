use std::time::Duration;

use crate::{clock::Clock, device::IdentityReader};

/// Substring of the serial number string reported by a booted PongoOS.
pub const PONGO_IDENTITY_MARKER: &str = "SRTG:[PongoOS";

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub deadline: Duration,
    pub poll_interval: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootConfirmation {
    Confirmed { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl BootConfirmation {
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, BootConfirmation::Confirmed { .. })
    }
}

pub fn is_pongo(identity: &str) -> bool {
    identity.contains(PONGO_IDENTITY_MARKER)
}

/// Polls the device identity until it reports PongoOS or `options.deadline` elapses.
pub fn await_boot<R: IdentityReader, C: Clock>(
    reader: &mut R,
    clock: &C,
    options: &MonitorOptions,
) -> BootConfirmation {
    let start = clock.now();

    loop {
        match reader.identity() {
            Some(identity) if is_pongo(&identity) => {
                let elapsed = clock.now() - start;
                tracing::debug!("PongoOS identified itself after {elapsed:.2?}: '{identity}'");
                return BootConfirmation::Confirmed { elapsed };
            }
            Some(identity) => tracing::trace!("Device is not PongoOS yet: '{identity}'"),
            None => tracing::trace!("Device did not report a serial number"),
        }

        let elapsed = clock.now() - start;
        if elapsed >= options.deadline {
            tracing::warn!("Timed out waiting for PongoOS to boot");
            return BootConfirmation::TimedOut { elapsed };
        }

        clock.sleep(options.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, ScriptedReader};

    const POLL: Duration = DEFAULT_POLL_INTERVAL;

    #[test]
    fn confirms_on_first_poll() {
        let clock = ManualClock::new();
        let mut reader = ScriptedReader::booting_at(&clock, Duration::ZERO);

        let result = await_boot(&mut reader, &clock, &MonitorOptions::default());

        assert_eq!(
            result,
            BootConfirmation::Confirmed {
                elapsed: Duration::ZERO
            }
        );
        assert_eq!(reader.reads, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn confirms_within_one_poll_of_boot() {
        for boot_ms in [1, 250, 999, 4_321, 9_950] {
            let boot_at = Duration::from_millis(boot_ms);
            let clock = ManualClock::new();
            let mut reader = ScriptedReader::booting_at(&clock, boot_at);

            let result = await_boot(&mut reader, &clock, &MonitorOptions::default());

            let BootConfirmation::Confirmed { elapsed } = result else {
                panic!("expected confirmation for boot at {boot_at:?}, got {result:?}");
            };
            assert!(elapsed >= boot_at, "{elapsed:?} < {boot_at:?}");
            assert!(elapsed < boot_at + POLL, "{elapsed:?} >= {boot_at:?} + poll");
        }
    }

    #[test]
    fn times_out_within_one_poll_of_deadline() {
        let clock = ManualClock::new();
        let mut reader = ScriptedReader::never_booting(&clock);

        let result = await_boot(&mut reader, &clock, &MonitorOptions::default());

        let BootConfirmation::TimedOut { elapsed } = result else {
            panic!("expected timeout, got {result:?}");
        };
        assert!(elapsed >= DEFAULT_DEADLINE);
        assert!(elapsed < DEFAULT_DEADLINE + POLL);
        assert!(clock.sleeps().iter().all(|&sleep| sleep == POLL));
        assert!(!result.is_confirmed());
    }

    #[test]
    fn non_pongo_identity_keeps_polling() {
        let clock = ManualClock::new();
        let mut reader = ScriptedReader::never_booting(&clock)
            .with_identity("CPID:8010 SRTG:[iBoot-2696.0.0.1.33] PWND:[checkm8]");

        let options = MonitorOptions {
            deadline: Duration::from_secs(1),
            poll_interval: Duration::from_millis(250),
        };
        let result = await_boot(&mut reader, &clock, &options);

        assert_eq!(
            result,
            BootConfirmation::TimedOut {
                elapsed: Duration::from_secs(1)
            }
        );
        assert_eq!(reader.reads, 5);
    }

    #[test]
    fn marker_match_is_a_substring_match() {
        assert!(is_pongo("SRTG:[PongoOS-2.6.2-6cfdf26]"));
        assert!(is_pongo("CPID:8010 SRTG:[PongoOS-2.6.2]"));
        assert!(!is_pongo("SRTG:[iBoot-2696.0.0.1.33]"));
        assert!(!is_pongo("PongoOS"));
    }
}
