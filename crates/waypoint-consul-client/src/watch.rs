// Blocking-query change source over a Consul KV prefix

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;
use waypoint_common::{
    AccessTokenHolder, KvPair, Poll, RegistryError, Result, Snapshot,
    kv,
    watch::ChangeSource,
};

use crate::{
    api::{BlockingQuery, ConsulApi},
    model::KVPair,
};

/// Watches every key under a prefix with `?recurse&index=&wait=`
pub struct ConsulKvSource {
    api: ConsulApi,
    token: Arc<AccessTokenHolder>,
    prefix: String,
    wait: Duration,
}

impl ConsulKvSource {
    pub fn new(api: ConsulApi, token: Arc<AccessTokenHolder>, prefix: String, wait: Duration) -> Self {
        Self {
            api,
            token,
            prefix,
            wait,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Decode wire pairs into string pairs with keys relative to `prefix`
pub(crate) fn relative_pairs(prefix: &str, pairs: Vec<KVPair>) -> Result<Vec<KvPair>> {
    let decoded = pairs
        .into_iter()
        .map(|pair| {
            let value = pair
                .decoded_value()
                .map_err(|e| RegistryError::Decode(format!("value of {}: {}", pair.key, e)))?;
            Ok(KvPair::new(
                pair.key,
                String::from_utf8_lossy(&value).into_owned(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(kv::relative_to(prefix, decoded))
}

#[async_trait]
impl ChangeSource for ConsulKvSource {
    fn describe(&self) -> String {
        format!("consul kv {}", self.prefix)
    }

    async fn fetch(&self, last_index: u64) -> Result<Poll> {
        let query = BlockingQuery {
            index: last_index,
            wait: self.wait,
        };
        let api = &self.api;
        let prefix = self.prefix.as_str();

        let result = self
            .token
            .with_retry("watch", |token| async move {
                api.kv_list(&token, prefix, Some(query)).await
            })
            .await?;

        // An index that goes backwards means the agent lost state; start over.
        let index = if result.index < last_index {
            debug!(prefix = %self.prefix, last_index, index = result.index, "Consul index went backwards, resetting");
            0
        } else {
            result.index
        };

        if result.value.is_empty() {
            return Ok(Poll::Empty);
        }
        if index == last_index && index != 0 {
            return Ok(Poll::Unchanged);
        }

        let pairs = relative_pairs(&self.prefix, result.value)?;
        if pairs.is_empty() {
            return Ok(Poll::Empty);
        }

        Ok(Poll::Changed(Snapshot {
            // An index of zero never counts as a change, so a reset still delivers.
            index: index.max(1),
            pairs,
        }))
    }
}
