//! Anonymized usage counters sent with release queries.
//!
//! Only presence flags and counts leave the host, never names or content.

use serde_json::Value;
use tracing::debug;

use crate::client::UsageParams;
use crate::platform::PlatformContext;
use crate::store::{keys, StateStore, StoreError};

/// Collect usage parameters from the store.
pub async fn collect_usage_params(
    store: &dyn StateStore,
    platform: &PlatformContext,
    dev_mode: bool,
) -> Result<UsageParams, StoreError> {
    let mut params = UsageParams::new();

    let node_id = store
        .get_field(keys::HOST_INFO, "node")
        .await?
        .unwrap_or_else(|| platform.node_id.clone());
    if !node_id.is_empty() {
        params.insert("nid".to_string(), node_id);
    }

    if let Some(raw) = store.get_field(keys::TRANSCODE_CONFIG, "global").await? {
        match serde_json::from_str::<Value>(&raw) {
            Ok(conf) if conf.get("all").and_then(Value::as_bool) == Some(true) => {
                params.insert("tran".to_string(), "1".to_string());
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Ignoring unreadable transcode config"),
        }
    }

    flag(store, &mut params, "rkd", keys::RECORD_PATTERNS, "all").await?;
    count(store, &mut params, "rkdn", keys::RECORD_M3U8_ARTIFACT).await?;
    flag(store, &mut params, "cos", keys::TENCENT_COS, "bucket").await?;
    count(store, &mut params, "cosn", keys::DVR_M3U8_ARTIFACT).await?;
    flag(store, &mut params, "vod", keys::TENCENT_VOD, "storage").await?;
    count(store, &mut params, "vodn", keys::VOD_M3U8_ARTIFACT).await?;
    count(store, &mut params, "forward", keys::FORWARD_TASK).await?;
    count(store, &mut params, "vfile", keys::VLIVE_TASK).await?;

    if store
        .get_field(keys::UPGRADE_WINDOW, "update")
        .await?
        .is_some()
    {
        params.insert("uwin".to_string(), "1".to_string());
    }

    if dev_mode {
        params.insert("dev".to_string(), "1".to_string());
    }

    let srs_dev = store.get_field(keys::CONTAINER_DISABLED, "srs-dev").await?;
    if srs_dev.as_deref() == Some("false") {
        params.insert("srsd".to_string(), "1".to_string());
    }

    params.insert("cloud".to_string(), platform.cloud.clone());
    if let Some(region) = &platform.region {
        params.insert("region".to_string(), region.clone());
    }

    Ok(params)
}

async fn flag(
    store: &dyn StateStore,
    params: &mut UsageParams,
    param: &str,
    key: &str,
    field: &str,
) -> Result<(), StoreError> {
    if store.get_field(key, field).await?.as_deref() == Some("true") {
        params.insert(param.to_string(), "1".to_string());
    }
    Ok(())
}

async fn count(
    store: &dyn StateStore,
    params: &mut UsageParams,
    param: &str,
    key: &str,
) -> Result<(), StoreError> {
    let n = store.len(key).await?;
    if n > 0 {
        params.insert(param.to_string(), n.to_string());
    }
    Ok(())
}
