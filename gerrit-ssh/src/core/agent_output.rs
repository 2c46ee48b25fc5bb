//! Parsing of `ssh-agent -s` shell output.
//!
//! The agent announces itself with Bourne-shell lines such as:
//!
//! ```text
//! SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
//! echo Agent pid 123;
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

pub const AUTH_SOCK_VAR: &str = "SSH_AUTH_SOCK";

/// What one stdout line contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentLine {
    /// `KEY=VALUE;` assignments in line order.
    pub assignments: Vec<(String, String)>,
    /// Self-reported pid from `echo Agent pid N;`.
    pub pid: Option<u32>,
}

pub fn parse_agent_line(line: &str) -> AgentLine {
    static ENV_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"([A-Z][A-Z0-9_a-z]+)=([^;]+)(;|$)").expect("valid regex")
    });
    static PID_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^echo Agent pid ([0-9]+);").expect("valid regex"));

    let assignments = ENV_RE
        .captures_iter(line)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect();
    let pid = PID_RE
        .captures(line)
        .and_then(|caps| caps[1].parse::<u32>().ok());
    AgentLine { assignments, pid }
}

/// Environment exported by a running agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentEnv {
    vars: BTreeMap<String, String>,
}

impl AgentEnv {
    pub fn absorb(&mut self, line: &AgentLine) {
        for (key, value) in &line.assignments {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn auth_sock(&self) -> Option<&str> {
        self.get(AUTH_SOCK_VAR)
    }
}
