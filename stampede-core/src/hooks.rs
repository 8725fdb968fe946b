use async_trait::async_trait;

use crate::error::SetupFailure;
use crate::scenario::RunData;

/// A step run once before (setup) or after (teardown) the load phase.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, data: &mut RunData) -> Result<(), SetupFailure>;
}

/// Hooks run in order; the first failure stops the chain.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn Hook>>,
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn push(&mut self, hook: Box<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub async fn run(&self, data: &mut RunData) -> Result<(), SetupFailure> {
        for hook in &self.hooks {
            tracing::debug!(hook = hook.name(), "running hook");
            hook.run(data).await?;
            tracing::info!(hook = hook.name(), "hook finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Put(&'static str, &'static str);

    #[async_trait]
    impl Hook for Put {
        fn name(&self) -> &str {
            "put"
        }

        async fn run(&self, data: &mut RunData) -> Result<(), SetupFailure> {
            data.insert(self.0, self.1);
            Ok(())
        }
    }

    struct Fail(Arc<AtomicUsize>);

    #[async_trait]
    impl Hook for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        async fn run(&self, _data: &mut RunData) -> Result<(), SetupFailure> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Err(SetupFailure::hook("fail", "nope"))
        }
    }

    #[tokio::test]
    async fn hooks_share_run_data() {
        let chain = HookChain::new().with(Put("a", "1")).with(Put("b", "2"));
        let mut data = RunData::default();
        chain
            .run(&mut data)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(data.get("a"), Some("1"));
        assert_eq!(data.get("b"), Some("2"));
    }

    #[tokio::test]
    async fn first_failure_stops_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = HookChain::new()
            .with(Fail(calls.clone()))
            .with(Fail(calls.clone()));

        let err = chain.run(&mut RunData::default()).await;
        assert!(matches!(err, Err(SetupFailure::Hook { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
