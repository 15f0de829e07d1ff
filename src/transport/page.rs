use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::config::RenderConfig;
use crate::error::DocError;
use crate::render::{RenderTask, SurfaceSlot};
use crate::rpc::endpoint::RpcEndpoint;
use crate::rpc::message::Payload;
use crate::rpc::stream::StreamHandle;
use crate::transport::operator_list::{OperatorListBucket, OperatorListChunk, RenderIntent};
use crate::transport::remote::{OperatorListParams, PageInfo};
use crate::transport::ACTION_GET_OPERATOR_LIST;

struct IntentState {
    bucket: Arc<OperatorListBucket>,
    stream: Arc<StreamHandle>,
}

#[derive(Default)]
struct PageState {
    intents: FxHashMap<RenderIntent, IntentState>,
    render_tasks: Vec<RenderTask>,
    destroyed: bool,
}

/// The main side's handle for one page of an open document
pub struct PageProxy {
    info: PageInfo,
    endpoint: RpcEndpoint,
    render_config: RenderConfig,
    state: Mutex<PageState>,
}

impl Debug for PageProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageProxy{{{}}}", self.info.page_index)
    }
}

impl PageProxy {
    pub(crate) fn new(info: PageInfo, endpoint: RpcEndpoint, render_config: RenderConfig) -> PageProxy {
        PageProxy {
            info,
            endpoint,
            render_config,
            state: Default::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn page_index(&self) -> u32 {
        self.info.page_index
    }

    pub fn info(&self) -> &PageInfo {
        &self.info
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// The operator list for `intent`. It is requested from the remote side once per intent and
    ///  then shared; only a list that failed is requested again.
    pub fn operator_list(&self, intent: RenderIntent) -> Result<Arc<OperatorListBucket>, DocError> {
        let mut state = self.state();
        if state.destroyed {
            return Err(DocError::abort(format!("page {} was destroyed", self.info.page_index)));
        }
        if let Some(existing) = state.intents.get(&intent) {
            if existing.bucket.error().is_none() {
                trace!(page_index = self.info.page_index, %intent, "reusing operator list");
                return Ok(existing.bucket.clone());
            }
        }

        debug!(page_index = self.info.page_index, %intent, "requesting operator list");
        let params = Payload::from_serde(&OperatorListParams { page_index: self.info.page_index, intent })?;
        let stream = Arc::new(self.endpoint.open_stream(ACTION_GET_OPERATOR_LIST, params, None));
        let bucket = Arc::new(OperatorListBucket::new(intent));
        tokio::spawn(pump_operator_list(self.info.page_index, stream.clone(), bucket.clone()));

        state.intents.insert(intent, IntentState { bucket: bucket.clone(), stream });
        Ok(bucket)
    }

    /// Starts rendering the operator list for `intent` on `surface`. Using a surface that
    ///  another render task is still using is an error.
    pub fn render(&self, intent: RenderIntent, surface: &Arc<SurfaceSlot>) -> anyhow::Result<RenderTask> {
        let lease = surface.acquire()?;
        let bucket = self.operator_list(intent)?;
        let task = RenderTask::start(bucket, lease, self.render_config.clone(), None);

        let mut state = self.state();
        if state.destroyed {
            task.cancel();
            bail!("page {} was destroyed", self.info.page_index);
        }
        state.render_tasks.retain(|t| !t.is_done());
        state.render_tasks.push(task.clone());
        Ok(task)
    }

    /// Cancels the page's render tasks and the operator list streams still in flight. Later
    ///  calls have no effect.
    pub async fn destroy(&self) {
        let (render_tasks, intents) = {
            let mut state = self.state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            (std::mem::take(&mut state.render_tasks), std::mem::take(&mut state.intents))
        };

        debug!(page_index = self.info.page_index, render_tasks = render_tasks.len(), "destroying page");
        for task in render_tasks {
            task.cancel();
        }

        let reason = DocError::abort(format!("page {} was destroyed", self.info.page_index));
        for (intent, intent_state) in intents {
            if intent_state.bucket.is_complete() {
                continue;
            }
            intent_state.bucket.fail(reason.clone());
            if let Err(e) = intent_state.stream.cancel(reason.clone()).await {
                debug!(page_index = self.info.page_index, %intent, error = %e, "cancelling operator list stream failed");
            }
        }
    }
}

async fn pump_operator_list(page_index: u32, stream: Arc<StreamHandle>, bucket: Arc<OperatorListBucket>) {
    loop {
        match stream.read().await {
            Ok(Some(payload)) => {
                let chunk = match payload.decode::<OperatorListChunk>() {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        bucket.fail(e.clone());
                        let _ = stream.cancel(e).await;
                        return;
                    }
                };
                let last_chunk = chunk.last_chunk;
                bucket.append(chunk);
                if last_chunk {
                    trace!(page_index, intent = %bucket.intent(), len = bucket.len(), "operator list complete");
                    return;
                }
            }
            Ok(None) => {
                if !bucket.is_complete() {
                    bucket.fail(DocError::abort(format!("operator list stream for page {} ended before the last chunk", page_index)));
                }
                return;
            }
            Err(e) => {
                debug!(page_index, error = %e, "operator list failed");
                bucket.fail(e);
                return;
            }
        }
    }
}
