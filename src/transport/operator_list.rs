use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::trace;

use crate::error::DocError;

/// The rendering purpose a page's operator list is produced for. Each intent has its own
///  operator list per page.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderIntent {
    Display,
    Print,
}

impl Display for RenderIntent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderIntent::Display => write!(f, "display"),
            RenderIntent::Print => write!(f, "print"),
        }
    }
}

/// One chunk of a page's drawing program as the remote side streams it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorListChunk {
    pub fn_array: Vec<u32>,
    pub args_array: Vec<Value>,
    pub last_chunk: bool,
}

impl OperatorListChunk {
    pub fn len(&self) -> usize {
        self.fn_array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fn_array.is_empty()
    }
}

/// The drawing program received so far
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperatorList {
    pub fn_array: Vec<u32>,
    pub args_array: Vec<Value>,
    /// `true` once the remote side sent the last chunk - nothing is appended after that
    pub last_chunk: bool,
}

impl OperatorList {
    pub fn len(&self) -> usize {
        self.fn_array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fn_array.is_empty()
    }
}

#[derive(Debug, Default)]
struct BucketState {
    list: OperatorList,
    error: Option<DocError>,
}

impl BucketState {
    fn is_settled(&self) -> bool {
        self.list.last_chunk || self.error.is_some()
    }
}

/// A page's operator list for one intent. It grows as chunks arrive, and render tasks can
///  start executing it before it is complete.
#[derive(Debug)]
pub struct OperatorListBucket {
    intent: RenderIntent,
    state: watch::Sender<BucketState>,
}

impl OperatorListBucket {
    pub fn new(intent: RenderIntent) -> OperatorListBucket {
        let (state, _) = watch::channel(BucketState::default());
        OperatorListBucket { intent, state }
    }

    pub fn intent(&self) -> RenderIntent {
        self.intent
    }

    /// Appends a chunk. Chunks arriving after the last chunk or an error are dropped.
    pub fn append(&self, chunk: OperatorListChunk) {
        self.state.send_if_modified(|state| {
            if state.is_settled() {
                trace!(intent = %self.intent, "dropping operator list chunk for a settled bucket");
                return false;
            }
            state.list.fn_array.extend(chunk.fn_array);
            state.list.args_array.extend(chunk.args_array);
            state.list.last_chunk = chunk.last_chunk;
            true
        });
    }

    /// Ends the list with an error. A complete list can not fail any more.
    pub fn fail(&self, reason: DocError) {
        self.state.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            state.error = Some(reason);
            true
        });
    }

    pub fn len(&self) -> usize {
        self.state.borrow().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.state.borrow().list.last_chunk
    }

    pub fn error(&self) -> Option<DocError> {
        self.state.borrow().error.clone()
    }

    /// Gives `f` access to the list received so far, or the error it ended with. This holds
    ///  a lock on the bucket, so `f` must not block.
    pub fn with_list<R>(&self, f: impl FnOnce(Result<&OperatorList, &DocError>) -> R) -> R {
        let state = self.state.borrow();
        match &state.error {
            Some(e) => f(Err(e)),
            None => f(Ok(&state.list)),
        }
    }

    /// Resolves once the list has more than `known_len` operators, is complete, or failed.
    pub async fn wait_for_more(&self, known_len: usize) {
        let mut receiver = self.state.subscribe();
        // the sender lives in `self`, so this can not fail
        let _ = receiver.wait_for(|state| state.list.len() > known_len || state.is_settled()).await;
    }

    /// Resolves with the complete list, or the error it ended with.
    pub async fn complete(&self) -> Result<OperatorList, DocError> {
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|state| state.is_settled()).await;
        let state = receiver.borrow();
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(state.list.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use rstest::rstest;
    use serde_json::json;
    use super::*;

    fn chunk(ops: &[u32], last_chunk: bool) -> OperatorListChunk {
        OperatorListChunk {
            fn_array: ops.to_vec(),
            args_array: ops.iter().map(|op| json!([op])).collect(),
            last_chunk,
        }
    }

    #[test]
    fn test_chunk_wire_shape() {
        let value = serde_json::to_value(chunk(&[1, 2], true)).unwrap();
        assert_eq!(value, json!({"fnArray": [1, 2], "argsArray": [[1], [2]], "lastChunk": true}));
    }

    #[rstest]
    #[case::display(RenderIntent::Display, "\"display\"")]
    #[case::print(RenderIntent::Print, "\"print\"")]
    fn test_intent_wire_name(#[case] intent: RenderIntent, #[case] expected: &str) {
        assert_eq!(serde_json::to_string(&intent).unwrap(), expected);
        assert_eq!(serde_json::from_str::<RenderIntent>(expected).unwrap(), intent);
    }

    #[tokio::test]
    async fn test_append_until_last_chunk() {
        let bucket = OperatorListBucket::new(RenderIntent::Display);
        bucket.append(chunk(&[1, 2], false));
        assert_eq!(bucket.len(), 2);
        assert!(!bucket.is_complete());

        bucket.append(chunk(&[3], true));
        bucket.append(chunk(&[4], false));
        bucket.fail(DocError::abort("too late"));

        let list = bucket.complete().await.unwrap();
        assert_eq!(list.fn_array, vec![1, 2, 3]);
        assert!(list.last_chunk);
        assert_eq!(bucket.error(), None);
    }

    #[tokio::test]
    async fn test_failure_ends_the_list() {
        let bucket = OperatorListBucket::new(RenderIntent::Print);
        bucket.append(chunk(&[1], false));
        bucket.fail(DocError::invalid_document("broken content stream"));
        bucket.append(chunk(&[2], true));

        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.complete().await, Err(DocError::invalid_document("broken content stream")));
        assert!(bucket.with_list(|list| list.is_err()));
    }

    #[tokio::test]
    async fn test_wait_for_more_wakes_on_append() {
        let bucket = Arc::new(OperatorListBucket::new(RenderIntent::Display));
        bucket.append(chunk(&[1], false));

        let bucket2 = bucket.clone();
        let waiting = tokio::spawn(async move { bucket2.wait_for_more(1).await });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        bucket.append(chunk(&[2], false));
        tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    }
}
