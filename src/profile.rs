//! Per-subject display profile kept only in the local store.
//!
//! Keys are `profile_v1:<subject>`; with no decodable credential the
//! `anonymous` namespace is used. The namespace is derived from the session
//! snapshot, so it flips in the same step as the credential.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::MAX_AVATAR_BYTES;
use crate::error::{ClientError, Result};
use crate::models::Profile;
use crate::storage::LocalStore;

pub const PROFILE_KEY_PREFIX: &str = "profile_v1:";
const ANONYMOUS: &str = "anonymous";

/// Avatar image picked by the user.
#[derive(Debug, Clone)]
pub struct AvatarUpload {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Edit submitted from the profile form. A `None` field keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ProfileEdit {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<AvatarUpload>,
}

#[derive(Clone)]
pub struct ProfileCache {
    store: LocalStore,
}

impl ProfileCache {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn key_for(subject: Option<&str>) -> String {
        match subject {
            Some(s) if !s.is_empty() => format!("{PROFILE_KEY_PREFIX}{s}"),
            _ => format!("{PROFILE_KEY_PREFIX}{ANONYMOUS}"),
        }
    }

    /// Missing or corrupt entries degrade to the empty profile.
    pub fn load(&self, subject: Option<&str>) -> Profile {
        let key = Self::key_for(subject);
        match self.store.get_profile(&key) {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::debug!(%key, error = %e, "stored profile did not decode");
                Profile::default()
            }),
            Ok(None) => Profile::default(),
            Err(e) => {
                tracing::warn!(%key, error = %e, "profile store unreadable");
                Profile::default()
            }
        }
    }

    pub fn save(&self, subject: Option<&str>, profile: &Profile) -> Result<()> {
        let key = Self::key_for(subject);
        let raw = serde_json::to_vec(profile)?;
        self.store.put_profile(&key, &raw)
    }
}

/// Merge an edit into the current profile. Name and bio are trimmed.
pub fn apply_edit(mut current: Profile, edit: ProfileEdit) -> Result<Profile> {
    if let Some(name) = edit.name {
        current.name = name.trim().to_string();
    }
    if let Some(bio) = edit.bio {
        current.bio = bio.trim().to_string();
    }
    if let Some(avatar) = edit.avatar {
        if avatar.bytes.len() > MAX_AVATAR_BYTES {
            return Err(ClientError::validation("Avatar too big (max 2MB)"));
        }
        current.avatar = avatar_data_url(&avatar);
    }
    Ok(current)
}

fn avatar_data_url(avatar: &AvatarUpload) -> String {
    let mime = if avatar.mime.trim().is_empty() {
        "application/octet-stream"
    } else {
        avatar.mime.trim()
    };
    format!("data:{};base64,{}", mime, STANDARD.encode(&avatar.bytes))
}
