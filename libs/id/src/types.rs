//! Controller instance identifiers and names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::IdError;

/// Unique id of one controller instance registration, `ci_{ulid}`.
///
/// Ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(Ulid);

impl InstanceId {
    pub const PREFIX: &'static str = "ci";

    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Parse `ci_{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let (prefix, ulid) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }
        ulid.parse::<Ulid>()
            .map(Self)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.to_string()
    }
}

/// Build the registry name for a new controller instance.
///
/// The controller type is kept as a readable prefix; uniqueness comes from
/// the ULID, so two processes of the same type never collide.
#[must_use]
pub fn instance_name(controller_type: &str, id: &InstanceId) -> String {
    format!("{controller_type}-{id}")
}

/// Split an instance name back into its controller type and [`InstanceId`].
pub fn parse_instance_name(controller_type: &str, name: &str) -> Result<InstanceId, IdError> {
    let Some(rest) = name
        .strip_prefix(controller_type)
        .and_then(|rest| rest.strip_prefix('-'))
    else {
        return Err(IdError::ControllerTypeMismatch {
            name: name.to_string(),
            controller_type: controller_type.to_string(),
        });
    };

    InstanceId::parse(rest)
}
