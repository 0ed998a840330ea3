//! Reference environments for vmail.
//!
//! - `PointReach` - 2-D point mass reaching a target, rendered to 64×64 RGB
//! - `ScriptedExpert` - controller that records PointReach demonstrations

mod expert;
mod point_reach;

pub use expert::{record_demonstrations, ScriptedExpert};
pub use point_reach::{PointReach, FRAME_SIZE};

use std::fmt;
use std::str::FromStr;
use vmail::env::Environment;
use vmail::{Result, VmailError};

/// Closed set of tasks the CLI can build by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvKind {
    PointReach,
}

impl EnvKind {
    pub const ALL: [EnvKind; 1] = [EnvKind::PointReach];

    pub fn name(&self) -> &'static str {
        match self {
            EnvKind::PointReach => "point_reach",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EnvKind::PointReach => "2-D point mass reaching a target, 64x64 RGB + [x, y, vx, vy]",
        }
    }

    /// Build a fresh instance seeded with `seed`.
    pub fn make(&self, seed: u64) -> Box<dyn Environment> {
        match self {
            EnvKind::PointReach => Box::new(PointReach::new(seed)),
        }
    }
}

impl FromStr for EnvKind {
    type Err = VmailError;

    fn from_str(s: &str) -> Result<Self> {
        EnvKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.to_lowercase())
            .ok_or_else(|| {
                let known: Vec<_> = EnvKind::ALL.iter().map(|k| k.name()).collect();
                VmailError::Config(format!(
                    "unknown env '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}

impl fmt::Display for EnvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_kind_parse() {
        assert_eq!("point_reach".parse::<EnvKind>().unwrap(), EnvKind::PointReach);
        assert_eq!("Point_Reach".parse::<EnvKind>().unwrap(), EnvKind::PointReach);
        let err = "cartpole".parse::<EnvKind>().unwrap_err();
        assert!(matches!(err, VmailError::Config(_)));
        assert!(err.to_string().contains("point_reach"));
    }

    #[test]
    fn test_env_kind_make() {
        let mut env = EnvKind::PointReach.make(0);
        assert_eq!(env.action_space().action_dim(), 2);
        assert_eq!(env.proprio_size(), Some(4));
        let obs = env.reset().unwrap();
        assert_eq!(obs.image.shape(), &[FRAME_SIZE, FRAME_SIZE, 3]);
    }
}
