//! Classification of the transport's verbose trace into protocol milestones.
//!
//! The milestones are recovered by matching OpenSSH's `-v` log wording, which
//! is not a stable interface. All of that coupling lives behind
//! [`TraceClassifier`]; the state machines only see [`TraceEvent`]s.

use std::sync::LazyLock;

use regex::Regex;

/// A protocol milestone observed on the trace channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// The server rejected our key.
    AuthenticationDenied,
    /// The remote end accepted the `gerrit` command.
    CommandStarted,
    /// Authoritative exit status of the remote command.
    ExitStatus(i32),
    /// The acting user lacks a server capability.
    CapabilityRequired(String),
}

/// Turns one trace line into at most one milestone.
pub trait TraceClassifier: Send + Sync {
    fn classify(&self, line: &str) -> Option<TraceEvent>;
}

/// Matches the wording of OpenSSH `ssh -v` and Gerrit's capability errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSshTrace;

impl TraceClassifier for OpenSshTrace {
    fn classify(&self, line: &str) -> Option<TraceEvent> {
        static BAD_AUTH: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^Permission denied").expect("valid regex"));
        static CMD_START: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^debug1: Sending command: gerrit").expect("valid regex")
        });
        static EXIT_STATUS: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^debug1: Exit status ([0-9-]+)").expect("valid regex")
        });
        static NEED_CAP: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^Capability ([^ ]+) is required").expect("valid regex")
        });

        if BAD_AUTH.is_match(line) {
            return Some(TraceEvent::AuthenticationDenied);
        }
        if CMD_START.is_match(line) {
            return Some(TraceEvent::CommandStarted);
        }
        if let Some(caps) = EXIT_STATUS.captures(line) {
            // "-" alone or an overflowing value is not a status.
            return caps[1].parse().ok().map(TraceEvent::ExitStatus);
        }
        if let Some(caps) = NEED_CAP.captures(line) {
            return Some(TraceEvent::CapabilityRequired(caps[1].to_string()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(line: &str) -> Option<TraceEvent> {
        OpenSshTrace.classify(line)
    }

    #[test]
    fn permission_denied_is_auth_failure() {
        assert_eq!(
            classify("Permission denied (publickey)."),
            Some(TraceEvent::AuthenticationDenied)
        );
    }

    #[test]
    fn sending_command_marks_start() {
        assert_eq!(
            classify("debug1: Sending command: gerrit version"),
            Some(TraceEvent::CommandStarted)
        );
        assert_eq!(
            classify("debug1: Sending command: gerrit stream-events"),
            Some(TraceEvent::CommandStarted)
        );
    }

    #[test]
    fn exit_status_is_parsed() {
        assert_eq!(
            classify("debug1: Exit status 0"),
            Some(TraceEvent::ExitStatus(0))
        );
        assert_eq!(
            classify("debug1: Exit status 1"),
            Some(TraceEvent::ExitStatus(1))
        );
        assert_eq!(
            classify("debug1: Exit status -1"),
            Some(TraceEvent::ExitStatus(-1))
        );
        assert_eq!(classify("debug1: Exit status -"), None);
    }

    #[test]
    fn capability_names_the_missing_grant() {
        assert_eq!(
            classify("Capability streamEvents is required to access this command."),
            Some(TraceEvent::CapabilityRequired("streamEvents".to_string()))
        );
    }

    #[test]
    fn matches_are_line_anchored_and_case_sensitive() {
        assert_eq!(classify("  Permission denied (publickey)."), None);
        assert_eq!(classify("permission denied"), None);
        assert_eq!(classify("debug2: Sending command: gerrit version"), None);
        assert_eq!(classify("debug1: Sending command: ls"), None);
        assert_eq!(classify("debug1: channel 0: free"), None);
    }
}
