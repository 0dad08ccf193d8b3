use crate::STUB_UUID;

use uuid::Uuid;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

/// Denormalized snapshot of a user, attached to each comment for display
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Profile {
    pub id: UserId,
    pub display_name: String,
}

impl Profile {
    /// Used when the profile lookup did not return anything for this user
    pub fn unknown(id: UserId) -> Profile {
        Profile {
            id,
            display_name: String::from("Unknown user"),
        }
    }
}
