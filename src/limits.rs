//! System-wide message queue limits.
//!
//! Linux exposes the defaults used when a queue is created without explicit attributes, as well
//! as the ceilings enforced on unprivileged processes, under `/proc/sys/fs/mqueue`. These can be
//! changed at any time by an administrator, so they are read on demand and never cached.

use crate::error::MqError;
use crate::macros::*;

const MSG_DEFAULT: &str = "/proc/sys/fs/mqueue/msg_default";
const MSGSIZE_DEFAULT: &str = "/proc/sys/fs/mqueue/msgsize_default";
const MSG_MAX: &str = "/proc/sys/fs/mqueue/msg_max";
const MSGSIZE_MAX: &str = "/proc/sys/fs/mqueue/msgsize_max";
const QUEUES_MAX: &str = "/proc/sys/fs/mqueue/queues_max";

/// Priority ceiling used when `sysconf` does not report one (`MQ_PRIO_MAX` on Linux).
pub const DEFAULT_PRIO_MAX: u32 = 32768;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemLimits {
    /// Capacity of a queue created without attributes.
    pub msg_default: usize,
    /// Maximum message size of a queue created without attributes.
    pub msgsize_default: usize,
    /// Largest capacity an unprivileged process may request.
    pub msg_max: usize,
    /// Largest maximum message size an unprivileged process may request.
    pub msgsize_max: usize,
    /// Number of queues which may exist system-wide.
    pub queues_max: usize,
}

impl SystemLimits {
    #[cfg_attr(test, tracing::instrument)]
    pub fn load() -> Result<Self, MqError> {
        let limits = Self {
            msg_default: read_limit(MSG_DEFAULT)?,
            msgsize_default: read_limit(MSGSIZE_DEFAULT)?,
            msg_max: read_limit(MSG_MAX)?,
            msgsize_max: read_limit(MSGSIZE_MAX)?,
            queues_max: read_limit(QUEUES_MAX)?,
        };
        debug!(?limits, "Loaded system limits");
        Ok(limits)
    }

    /// Capacity and message size a queue gets when created with no attributes.
    pub fn defaults() -> Result<(usize, usize), MqError> {
        Ok((read_limit(MSG_DEFAULT)?, read_limit(MSGSIZE_DEFAULT)?))
    }
}

/// The exclusive upper bound on message priorities: valid priorities are `0..prio_max()`.
pub fn prio_max() -> u32 {
    let max = unsafe { libc::sysconf(libc::_SC_MQ_PRIO_MAX) };
    num::cast(max).filter(|max| *max > 0).unwrap_or(DEFAULT_PRIO_MAX)
}

fn read_limit(path: &'static str) -> Result<usize, MqError> {
    let contents = std::fs::read_to_string(path).map_err(|e| MqError::SystemConfig {
        path,
        reason: e.to_string(),
        source: Some(e),
    })?;

    parse_limit(&contents).ok_or_else(|| MqError::SystemConfig {
        path,
        reason: format!("no number found in {contents:?}"),
        source: None,
    })
}

fn parse_limit(contents: &str) -> Option<usize> {
    contents.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::*;

    #[rstest::rstest]
    #[case("10\n", Some(10))]
    #[case("  8192  ", Some(8192))]
    #[case("", None)]
    #[case("ten", None)]
    #[case("-1", None)]
    fn parse(#[case] contents: &str, #[case] expected: Option<usize>) {
        assert_eq!(parse_limit(contents), expected);
    }

    #[rstest::rstest]
    fn load(#[allow(unused)] log_stdout: ()) {
        let limits = SystemLimits::load().unwrap();
        assert!(limits.msg_default >= 1);
        assert!(limits.msg_default <= limits.msg_max);
        assert!(limits.msgsize_default >= 1);
        assert!(limits.msgsize_default <= limits.msgsize_max);
        assert_eq!(SystemLimits::defaults().unwrap(), (limits.msg_default, limits.msgsize_default));
    }

    #[test]
    fn priority_ceiling() {
        assert_eq!(prio_max(), DEFAULT_PRIO_MAX);
    }
}
