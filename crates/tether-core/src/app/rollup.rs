//! ConcurrentRollup - sub-resource ごとの並列問い合わせと集約
//!
//! # 流れ
//! 1. sub-resource ごとに worker を 1 つ起動（`JoinSet`）
//! 2. 各 worker は 0 または 1 件の version record と primary シグナルを collector に追加
//! 3. 最初のエラーで残りの worker を abort し、部分結果は捨てる
//! 4. 全 worker 完了後、version 文字列でマージしてソート
//!
//! status は primary がちょうど 1 つのときだけその rollout state から決まり、
//! それ以外は `Pending`。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{
    ExternalObject, ExternalObjectVersion, ObjectStatus, RolloutState, RollupError, RollupRequest,
    SubResourceDetail,
};
use crate::ports::SubResourceSource;

#[derive(Debug, Default)]
struct Collector {
    versions: Vec<ExternalObjectVersion>,
    primaries: Vec<RolloutState>,
}

impl Collector {
    fn record(&mut self, detail: &SubResourceDetail, owner_id: Option<&str>) {
        if detail.primary {
            self.primaries.push(detail.rollout_state);
        }

        let replicas = detail.live_replicas();
        if replicas == 0 {
            debug!("[rollup] {} has no live instances", detail.id);
            return;
        }

        let owned = match (owner_id, detail.owner.as_deref()) {
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let version = if owned {
            detail.version.clone().unwrap_or_default()
        } else {
            String::new()
        };

        self.versions.push(ExternalObjectVersion {
            version,
            active: detail.primary,
            replicas,
            available_replicas: detail.running_count,
            target_replicas: detail.desired_count,
        });
    }
}

pub struct ConcurrentRollup {
    source: Arc<dyn SubResourceSource>,
    cancel: CancellationToken,
}

impl ConcurrentRollup {
    pub fn new(source: Arc<dyn SubResourceSource>, cancel: CancellationToken) -> Self {
        Self { source, cancel }
    }

    pub async fn run(&self, request: &RollupRequest) -> Result<ExternalObject, RollupError> {
        let collector = Arc::new(Mutex::new(Collector::default()));
        let mut workers = JoinSet::new();

        for id in &request.sub_resources {
            let source = self.source.clone();
            let collector = collector.clone();
            let owner_id = request.owner_id.clone();
            let id = id.clone();
            workers.spawn(async move {
                let detail = source.describe(&id).await?;
                collector
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(&detail, owner_id.as_deref());
                Ok::<(), RollupError>(())
            });
        }
        info!(
            "[rollup] {}: querying {} sub-resource(s)",
            request.name,
            workers.len()
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                joined = workers.join_next() => Some(joined),
            };
            let failure = match next {
                None => RollupError::Cancelled,
                Some(None) => break,
                Some(Some(Ok(Ok(())))) => continue,
                Some(Some(Ok(Err(e)))) => e,
                Some(Some(Err(e))) => RollupError::Worker(e.to_string()),
            };
            warn!("[rollup] {}: {}, aborting remaining workers", request.name, failure);
            workers.abort_all();
            return Err(failure);
        }

        let collected = std::mem::take(&mut *collector.lock().unwrap_or_else(|e| e.into_inner()));
        let status = rollup_status(&request.name, &collected.primaries);
        Ok(ExternalObject {
            name: request.name.clone(),
            object_type: request.object_type.clone(),
            status,
            versions: merge_versions(collected.versions),
        })
    }
}

fn rollup_status(name: &str, primaries: &[RolloutState]) -> ObjectStatus {
    match primaries {
        [only] => only.as_status(),
        _ => {
            warn!(
                "[rollup] {}: expected exactly one primary, found {}",
                name,
                primaries.len()
            );
            ObjectStatus::Pending
        }
    }
}

/// Merge records sharing a version string, ordered by version.
fn merge_versions(records: Vec<ExternalObjectVersion>) -> Vec<ExternalObjectVersion> {
    let mut merged: BTreeMap<String, ExternalObjectVersion> = BTreeMap::new();
    for record in records {
        match merged.get_mut(&record.version) {
            Some(existing) => existing.absorb(&record),
            None => {
                merged.insert(record.version.clone(), record);
            }
        }
    }
    merged.into_values().collect()
}
