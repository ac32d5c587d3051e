//! # Access
//!
//! Answers "may this caller act on this charity?".
//!
//! The caller triple comes from credential resolution upstream and is taken
//! as ground truth. Ownership is a numeric id match. Cosigner membership can
//! be matched two ways, and the two workflows use different ones:
//!
//! | Lookup                       | Matches on                      | Used by                 |
//! |------------------------------|---------------------------------|-------------------------|
//! | [`CosignerLookup::Email`]    | caller email == cosigner email  | approvals               |
//! | [`CosignerLookup::Identity`] | caller id == cosigner user id   | milestones              |
//! | [`CosignerLookup::Either`]   | either of the above             | signature collection    |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::Cosigner;
use crate::{Error, Result};

/// Account role carried by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    CharityOwner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::CharityOwner => "CHARITY_OWNER",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "USER" => Ok(Self::User),
            "CHARITY_OWNER" => Ok(Self::CharityOwner),
            other => Err(Error::Validation(format!("unknown role '{other}'"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved identity of whoever is making a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedCaller {
    pub id: i64,
    pub role: Role,
    pub email: String,
}

impl AuthenticatedCaller {
    /// `Forbidden` unless the account carries `role`.
    pub fn require_role(&self, role: Role, message: &str) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::Forbidden(message.to_string()))
        }
    }
}

/// How a caller is matched against a charity's cosigner list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CosignerLookup {
    Email,
    Identity,
    Either,
}

/// Ownership and active cosigners of one charity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharityAccess {
    pub charity_id: i64,
    pub owner_id: i64,
    pub cosigners: Vec<Cosigner>,
}

impl CharityAccess {
    pub fn is_owner(&self, caller: &AuthenticatedCaller) -> bool {
        self.owner_id == caller.id
    }

    pub fn is_cosigner(&self, caller: &AuthenticatedCaller, lookup: CosignerLookup) -> bool {
        self.cosigners.iter().any(|c| match lookup {
            CosignerLookup::Email => email_matches(c, caller),
            CosignerLookup::Identity => c.user_id == Some(caller.id),
            CosignerLookup::Either => email_matches(c, caller) || c.user_id == Some(caller.id),
        })
    }

    /// Owner, or a cosigner under `lookup`.
    pub fn is_member(&self, caller: &AuthenticatedCaller, lookup: CosignerLookup) -> bool {
        self.is_owner(caller) || self.is_cosigner(caller, lookup)
    }

    /// `Forbidden("Only the charity owner can {action}")` unless the caller owns the charity.
    pub fn require_owner(&self, caller: &AuthenticatedCaller, action: &str) -> Result<()> {
        if self.is_owner(caller) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "Only the charity owner can {action}"
            )))
        }
    }

    pub fn require_cosigner(
        &self,
        caller: &AuthenticatedCaller,
        lookup: CosignerLookup,
        action: &str,
    ) -> Result<()> {
        if self.is_cosigner(caller, lookup) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("Only cosigners can {action}")))
        }
    }

    pub fn require_member(
        &self,
        caller: &AuthenticatedCaller,
        lookup: CosignerLookup,
        action: &str,
    ) -> Result<()> {
        if self.is_member(caller, lookup) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "You are not authorized to {action} for this charity"
            )))
        }
    }
}

fn email_matches(cosigner: &Cosigner, caller: &AuthenticatedCaller) -> bool {
    !caller.email.is_empty() && cosigner.email == caller.email
}
