use std::fmt::Debug;

use kube::{api::PostParams, Api, Resource};
use serde::{de::DeserializeOwned, Serialize};

use crate::retry::{retry_with_backoff_if, RetryConfig};

use super::error::Error;

pub mod leak_checker;
pub mod listener;
pub mod node_watcher;
pub mod pod_watcher;
pub mod port_binding;
pub mod port_pool;

/// Replaces the status of the latest `name` after applying `update` to it.
///
/// Conflicts are retried on a freshly read object up to the configured attempts.
pub(crate) async fn update_status<K, F>(
    api: &Api<K>,
    name: &str,
    retry: &RetryConfig,
    update: F,
) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K),
{
    let update = &update;
    retry_with_backoff_if(
        retry,
        "update status",
        |e: &Error| e.is_conflict(),
        move || async move {
            let mut obj = api.get(name).await.map_err(Error::Kube)?;
            update(&mut obj);
            api.replace_status(
                name,
                &PostParams::default(),
                serde_json::to_vec(&obj).map_err(Error::Serialization)?,
            )
            .await
            .map_err(Error::Kube)
        },
    )
    .await
}
