use tokio::sync::watch;

/// A value that is set at most once and can be awaited by any number of tasks. Later calls to
///  [Latch::set] are ignored.
pub struct Latch<T> {
    sender: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> Default for Latch<T> {
    fn default() -> Self {
        Latch::new()
    }
}

impl<T: Clone + Send + Sync> Latch<T> {
    pub fn new() -> Latch<T> {
        let (sender, _) = watch::channel(None);
        Latch { sender }
    }

    /// returns `false` if the latch was already set
    pub fn set(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(value);
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.sender.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub async fn wait(&self) -> T {
        let mut receiver = self.sender.subscribe();
        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            // NB: the sender lives in `self`, so this can not fail while we wait
            let _ = receiver.changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use super::*;

    #[tokio::test]
    async fn test_first_set_wins() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        assert!(latch.set(1));
        assert!(!latch.set(2));
        assert_eq!(latch.get(), Some(1));
        assert_eq!(latch.wait().await, 1);
    }

    #[tokio::test]
    async fn test_wait_before_set() {
        let latch = Arc::new(Latch::new());
        let latch2 = latch.clone();
        let waiter = tokio::spawn(async move { latch2.wait().await });
        tokio::task::yield_now().await;

        latch.set("done");
        assert_eq!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap(), "done");
    }
}
