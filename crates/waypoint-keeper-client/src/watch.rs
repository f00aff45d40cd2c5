// Polling change source over a Keeper registration

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_trait::async_trait;
use waypoint_common::{AccessTokenHolder, Poll, Result, Snapshot, kv, watch::ChangeSource};

use crate::{api::KeeperApi, model::RegistrationDTO};

/// Polls one registration. Keeper has no change index, so the index is a hash of
/// the registration's content.
pub struct KeeperRegistrationSource {
    api: KeeperApi,
    token: Arc<AccessTokenHolder>,
    service_id: String,
}

impl KeeperRegistrationSource {
    pub fn new(api: KeeperApi, token: Arc<AccessTokenHolder>, service_id: String) -> Self {
        Self {
            api,
            token,
            service_id,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

/// Content index of a registration, never zero
pub(crate) fn content_index(registration: &RegistrationDTO) -> u64 {
    let mut hasher = DefaultHasher::new();
    registration.hash(&mut hasher);
    hasher.finish().max(1)
}

#[async_trait]
impl ChangeSource for KeeperRegistrationSource {
    fn describe(&self) -> String {
        format!("keeper registration {}", self.service_id)
    }

    async fn fetch(&self, last_index: u64) -> Result<Poll> {
        let api = &self.api;
        let service_id = self.service_id.as_str();
        let registration = self
            .token
            .with_retry("watch", |token| async move {
                api.registration(&token, service_id).await
            })
            .await?;

        let Some(registration) = registration else {
            return Ok(Poll::Empty);
        };

        let index = content_index(&registration);
        if index == last_index {
            return Ok(Poll::Unchanged);
        }

        Ok(Poll::Changed(Snapshot {
            index,
            pairs: kv::flatten_serialize(&registration)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_index_tracks_status() {
        let mut registration = RegistrationDTO {
            service_id: "core-data".to_string(),
            status: "DOWN".to_string(),
            ..Default::default()
        };
        let down = content_index(&registration);
        assert_eq!(down, content_index(&registration.clone()));

        registration.status = "UP".to_string();
        assert_ne!(down, content_index(&registration));
        assert_ne!(content_index(&registration), 0);
    }
}
