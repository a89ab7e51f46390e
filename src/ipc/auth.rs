//! Caller authentication for published service endpoints.
//!
//! Every call delivered to the wrapped endpoint first has its caller uid
//! compared against the uid that owns the client package. Mismatches are
//! rejected before the implementation sees the call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CallError;
use crate::identity::Uid;
use crate::ipc::{CallContext, Endpoint, Transaction};

/// Pass-through decorator that admits only one uid.
pub struct CallAuthenticator {
    expected: Uid,
    inner: Arc<dyn Endpoint>,
}

impl CallAuthenticator {
    pub fn new(expected: Uid, inner: Arc<dyn Endpoint>) -> Self {
        Self { expected, inner }
    }

    pub fn expected_uid(&self) -> Uid {
        self.expected
    }

    /// Check a caller without forwarding anything.
    pub fn authorize(&self, ctx: &CallContext) -> Result<(), CallError> {
        if ctx.caller().uid() != self.expected {
            return Err(CallError::Unauthorized {
                caller: ctx.caller(),
                expected: self.expected,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for CallAuthenticator {
    fn descriptor(&self) -> &str {
        self.inner.descriptor()
    }

    async fn transact(&self, ctx: &CallContext, txn: Transaction) -> Result<Value, CallError> {
        if let Err(e) = self.authorize(ctx) {
            tracing::warn!(
                descriptor = %self.inner.descriptor(),
                method = %txn.method,
                caller = %ctx.caller(),
                expected = %self.expected,
                "Rejected call from foreign caller"
            );
            return Err(e);
        }
        self.inner.transact(ctx, txn).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::identity::{CallerIdentity, Pid};

    /// Echoes its arguments back and counts invocations.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Endpoint for Echo {
        fn descriptor(&self) -> &str {
            "test.IEcho"
        }

        async fn transact(&self, _ctx: &CallContext, txn: Transaction) -> Result<Value, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if txn.method == "fail" {
                return Err(CallError::remote("boom"));
            }
            Ok(json!({ "method": txn.method, "args": txn.args }))
        }
    }

    fn ctx(uid: u32) -> CallContext {
        CallContext::new(CallerIdentity::new(Uid(uid), Pid(1234)))
    }

    #[tokio::test]
    async fn test_authorized_call_matches_direct_call() {
        let echo = Arc::new(Echo::default());
        let auth = CallAuthenticator::new(Uid(10_050), echo.clone());

        for args in [json!(null), json!([1, 2]), json!({"k": "v"})] {
            let direct = echo
                .transact(&ctx(10_050), Transaction::new("ping", args.clone()))
                .await;
            let through = auth
                .transact(&ctx(10_050), Transaction::new("ping", args))
                .await;
            assert_eq!(direct, through);
        }
    }

    #[tokio::test]
    async fn test_failure_propagates_verbatim() {
        let auth = CallAuthenticator::new(Uid(7), Arc::new(Echo::default()));
        let err = auth
            .transact(&ctx(7), Transaction::new("fail", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::remote("boom"));
    }

    #[tokio::test]
    async fn test_foreign_caller_never_reaches_implementation() {
        let echo = Arc::new(Echo::default());
        let auth = CallAuthenticator::new(Uid(10_050), echo.clone());

        for uid in [0, 1000, 10_049, 10_051, u32::MAX] {
            let err = auth
                .transact(&ctx(uid), Transaction::new("ping", Value::Null))
                .await
                .unwrap_err();
            match err {
                CallError::Unauthorized { caller, expected } => {
                    assert_eq!(caller.uid(), Uid(uid));
                    assert_eq!(expected, Uid(10_050));
                }
                other => panic!("Expected Unauthorized, got {:?}", other),
            }
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let echo = Arc::new(Echo::default());
        let auth = Arc::new(CallAuthenticator::new(Uid(5), echo.clone()));

        let mut handles = Vec::new();
        for i in 0..32u32 {
            let auth = Arc::clone(&auth);
            handles.push(tokio::spawn(async move {
                let uid = if i % 2 == 0 { 5 } else { 6 };
                auth.transact(&ctx(uid), Transaction::new("ping", json!(i)))
                    .await
                    .is_ok()
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 16);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 16);
    }
}
