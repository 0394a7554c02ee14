use crate::client::core::ApiClient;
use crate::types::{ApiResponse, BatchItemResult, BatchRequest, BatchResponse, RequestOptions};
use crate::{Error, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

type GroupResults = Vec<(usize, Result<ApiResponse>)>;

impl ApiClient {
    /// Run every item of `batch` and report per-item outcomes in input order.
    ///
    /// Items are admitted in groups of `requestQueue.batchSize`; the next group
    /// is admitted once the current one has resolved or `batchTimeout` has
    /// passed, whichever comes first. Each item is dispatched independently.
    pub async fn batch_request(&self, batch: BatchRequest) -> BatchResponse {
        let group_size = self.config.request_queue.batch_size.max(1);
        let window = self.config.request_queue.batch_timeout;
        let total = batch.requests.len();

        let mut done: Vec<Option<Result<ApiResponse>>> = (0..total).map(|_| None).collect();
        let mut pending: Vec<(Vec<usize>, JoinHandle<GroupResults>)> = Vec::new();

        for (group_index, group) in batch.requests.chunks(group_size).enumerate() {
            let offset = group_index * group_size;
            let mut waits = Vec::with_capacity(group.len());
            for (i, item) in group.iter().enumerate() {
                let index = offset + i;
                let options = RequestOptions::new().with_priority(batch.priority);
                match self.submit(item.method, &item.endpoint, item.body.clone(), options) {
                    Ok(handle) => waits.push((index, handle)),
                    Err(e) => done[index] = Some(Err(e)),
                }
            }
            let indices: Vec<usize> = waits.iter().map(|(i, _)| *i).collect();
            let mut task = tokio::spawn(join_all(
                waits
                    .into_iter()
                    .map(|(index, handle)| async move { (index, handle.wait().await) }),
            ));

            match tokio::time::timeout(window, &mut task).await {
                Ok(joined) => collect(&mut done, &indices, joined),
                Err(_) => {
                    debug!(group = group_index, "batch group still running, admitting next group");
                    pending.push((indices, task));
                }
            }
        }

        for (indices, task) in pending {
            collect(&mut done, &indices, task.await);
        }

        let results = done
            .into_iter()
            .enumerate()
            .map(|(index, r)| item_result(index, r.unwrap_or(Err(Error::Cancelled))))
            .collect();
        BatchResponse::from_results(results)
    }
}

fn collect(
    done: &mut [Option<Result<ApiResponse>>],
    indices: &[usize],
    joined: std::result::Result<GroupResults, tokio::task::JoinError>,
) {
    match joined {
        Ok(results) => {
            for (index, result) in results {
                done[index] = Some(result);
            }
        }
        Err(_) => {
            for index in indices {
                done[*index] = Some(Err(Error::ShuttingDown));
            }
        }
    }
}

fn item_result(index: usize, result: Result<ApiResponse>) -> BatchItemResult {
    match result {
        Ok(resp) => BatchItemResult {
            index,
            success: resp.success(),
            status: Some(resp.status),
            data: Some(resp.data),
            error: None,
        },
        Err(e) => BatchItemResult {
            index,
            success: false,
            status: e.status(),
            data: None,
            error: Some(e.to_string()),
        },
    }
}
