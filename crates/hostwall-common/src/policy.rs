//! Policy actions and kernel verdicts

use crate::ValueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy action returned by the rule engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Action {
    /// Let the packet through
    Allow = 0,
    /// Drop the packet
    Block = 1,
}

impl Default for Action {
    /// Fail closed
    fn default() -> Self {
        Self::Block
    }
}

impl Action {
    /// Lowercase keyword as stored in rule files and logs
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValueError;

    /// Accepts `allow`/`accept` and `block`/`drop`/`deny`, any case.
    /// Legacy `log`/`shape` are handled by [`LegacyAction`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "accept" => Ok(Self::Allow),
            "block" | "drop" | "deny" => Ok(Self::Block),
            _ => Err(ValueError::Action(s.to_string())),
        }
    }
}

/// Legacy rule actions that fold into [`Action::Allow`] plus a side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyAction {
    /// Allow and record
    Log,
    /// Allow through the shaper
    Shape,
}

impl LegacyAction {
    /// Lowercase keyword
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Shape => "shape",
        }
    }

    /// Recognise a legacy keyword, any case
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Some(Self::Log),
            "shape" => Some(Self::Shape),
            _ => None,
        }
    }
}

/// Verdict handed back to the kernel for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// NF_ACCEPT
    Accept,
    /// NF_DROP
    Drop,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => Self::Accept,
            Action::Block => Self::Drop,
        }
    }
}

impl Verdict {
    /// Action recorded in the event log for this verdict
    pub const fn action(&self) -> Action {
        match self {
            Self::Accept => Action::Allow,
            Self::Drop => Action::Block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_keywords() {
        assert_eq!("ALLOW".parse::<Action>().unwrap(), Action::Allow);
        assert_eq!("Drop".parse::<Action>().unwrap(), Action::Block);
        assert_eq!("block".parse::<Action>().unwrap(), Action::Block);
        assert!("log".parse::<Action>().is_err());
        assert_eq!(LegacyAction::parse("LOG"), Some(LegacyAction::Log));
    }

    #[test]
    fn test_default_fails_closed() {
        assert_eq!(Action::default(), Action::Block);
        assert_eq!(Verdict::from(Action::default()), Verdict::Drop);
    }
}
