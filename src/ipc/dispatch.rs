//! Typed forwarding stubs, generated per interface.
//!
//! [`service_interface!`](crate::service_interface) expands an interface
//! declaration into three items:
//!
//! - an async trait with one method per operation,
//! - `<Stub>`, an [`Endpoint`](crate::ipc::Endpoint) that routes frames by
//!   method name to a trait implementation,
//! - `<Proxy>`, a trait implementation that turns every call into a frame on
//!   a [`Channel`](crate::ipc::Channel).
//!
//! Arguments travel as a JSON array (the argument tuple), results as plain
//! JSON. Failures raised by the implementation come back unchanged.
//!
//! ```ignore
//! rootservice::service_interface! {
//!     /// Arithmetic running as root.
//!     pub trait Calculator: "com.example.ICalculator" {
//!         fn add(a: i64, b: i64) -> i64;
//!     }
//!     stub = CalculatorStub;
//!     proxy = CalculatorProxy;
//! }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CallError;

#[doc(hidden)]
pub mod __private {
    pub use async_trait::async_trait;
    pub use serde_json::Value;
}

/// Encode an argument tuple.
pub fn encode_args<A: Serialize>(method: &str, args: &A) -> Result<Value, CallError> {
    serde_json::to_value(args).map_err(|e| CallError::InvalidArguments {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Decode an argument tuple on the receiving side.
pub fn decode_args<A: DeserializeOwned>(method: &str, args: Value) -> Result<A, CallError> {
    serde_json::from_value(args).map_err(|e| CallError::InvalidArguments {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a method result on the receiving side.
pub fn encode_reply<R: Serialize>(method: &str, reply: &R) -> Result<Value, CallError> {
    serde_json::to_value(reply).map_err(|e| CallError::InvalidReply {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a method result on the calling side.
pub fn decode_reply<R: DeserializeOwned>(method: &str, reply: Value) -> Result<R, CallError> {
    serde_json::from_value(reply).map_err(|e| CallError::InvalidReply {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Declare a proxied interface and generate its stub and proxy.
///
/// Every operation must name its return type; use `-> ()` for none.
#[macro_export]
macro_rules! service_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident : $descriptor:literal {
            $(
                $(#[$mmeta:meta])*
                fn $method:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty ;
            )*
        }
        stub = $stub:ident ;
        proxy = $proxy:ident ;
    ) => {
        $(#[$meta])*
        #[$crate::ipc::dispatch::__private::async_trait]
        $vis trait $name: Send + Sync + 'static {
            $(
                $(#[$mmeta])*
                async fn $method(&self $(, $arg: $arg_ty)*)
                    -> ::std::result::Result<$ret, $crate::error::CallError>;
            )*
        }

        /// Routes incoming frames to an implementation of the interface.
        $vis struct $stub<T: ?Sized> {
            inner: ::std::sync::Arc<T>,
        }

        impl<T: ?Sized> ::std::clone::Clone for $stub<T> {
            fn clone(&self) -> Self {
                Self {
                    inner: ::std::sync::Arc::clone(&self.inner),
                }
            }
        }

        impl<T: $name + ?Sized> $stub<T> {
            pub const DESCRIPTOR: &'static str = $descriptor;

            pub fn new(inner: ::std::sync::Arc<T>) -> Self {
                Self { inner }
            }

            /// The implementation behind this stub.
            pub fn implementation(&self) -> &::std::sync::Arc<T> {
                &self.inner
            }

            /// The stub itself as a publishable endpoint.
            pub fn as_endpoint(&self) -> ::std::sync::Arc<dyn $crate::ipc::Endpoint> {
                ::std::sync::Arc::new(self.clone())
            }
        }

        #[$crate::ipc::dispatch::__private::async_trait]
        impl<T: $name + ?Sized> $crate::ipc::Endpoint for $stub<T> {
            fn descriptor(&self) -> &str {
                $descriptor
            }

            async fn transact(
                &self,
                _ctx: &$crate::ipc::CallContext,
                txn: $crate::ipc::Transaction,
            ) -> ::std::result::Result<
                $crate::ipc::dispatch::__private::Value,
                $crate::error::CallError,
            > {
                match txn.method.as_str() {
                    $(
                        stringify!($method) => {
                            let ($($arg,)*): ($($arg_ty,)*) =
                                $crate::ipc::dispatch::decode_args(stringify!($method), txn.args)?;
                            let reply = self.inner.$method($($arg),*).await?;
                            $crate::ipc::dispatch::encode_reply(stringify!($method), &reply)
                        }
                    )*
                    unknown => Err($crate::error::CallError::UnknownMethod {
                        descriptor: $descriptor.to_string(),
                        method: unknown.to_string(),
                    }),
                }
            }
        }

        /// Forwards typed calls over a channel.
        #[derive(Clone)]
        $vis struct $proxy {
            channel: ::std::sync::Arc<dyn $crate::ipc::Channel>,
        }

        impl $proxy {
            pub const DESCRIPTOR: &'static str = $descriptor;

            pub fn new(channel: ::std::sync::Arc<dyn $crate::ipc::Channel>) -> Self {
                Self { channel }
            }

            /// The channel this proxy talks through. Not forwarded.
            pub fn as_channel(&self) -> ::std::sync::Arc<dyn $crate::ipc::Channel> {
                ::std::sync::Arc::clone(&self.channel)
            }

            /// The proxy's channel as a publishable endpoint. Not forwarded.
            pub fn as_endpoint(&self) -> ::std::sync::Arc<dyn $crate::ipc::Endpoint> {
                self.channel.as_endpoint()
            }
        }

        #[$crate::ipc::dispatch::__private::async_trait]
        impl $name for $proxy {
            $(
                async fn $method(&self $(, $arg: $arg_ty)*)
                    -> ::std::result::Result<$ret, $crate::error::CallError>
                {
                    let args = $crate::ipc::dispatch::encode_args(
                        stringify!($method),
                        &($($arg,)*),
                    )?;
                    let reply = self
                        .channel
                        .call($crate::ipc::Transaction::new(stringify!($method), args))
                        .await?;
                    $crate::ipc::dispatch::decode_reply(stringify!($method), reply)
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::CallError;
    use crate::identity::{CallerIdentity, Pid, Uid};
    use crate::ipc::{CallContext, Endpoint, LocalChannel, Transaction};

    crate::service_interface! {
        /// Test interface.
        pub trait Greeter: "test.IGreeter" {
            fn greet(name: String) -> String;
            fn add(a: i64, b: i64) -> i64;
            fn ping() -> ();
            fn explode(reason: String) -> u32;
        }
        stub = GreeterStub;
        proxy = GreeterProxy;
    }

    struct Impl;

    #[async_trait]
    impl Greeter for Impl {
        async fn greet(&self, name: String) -> Result<String, CallError> {
            Ok(format!("hello {name}"))
        }

        async fn add(&self, a: i64, b: i64) -> Result<i64, CallError> {
            Ok(a + b)
        }

        async fn ping(&self) -> Result<(), CallError> {
            Ok(())
        }

        async fn explode(&self, reason: String) -> Result<u32, CallError> {
            Err(CallError::remote(reason))
        }
    }

    fn caller() -> CallerIdentity {
        CallerIdentity::new(Uid(1000), Pid(1))
    }

    fn proxy() -> GreeterProxy {
        let stub = GreeterStub::new(Arc::new(Impl));
        GreeterProxy::new(Arc::new(LocalChannel::new(stub.as_endpoint(), caller())))
    }

    #[tokio::test]
    async fn test_proxy_matches_direct_call() {
        let p = proxy();
        assert_eq!(p.greet("root".into()).await, Impl.greet("root".into()).await);
        assert_eq!(p.add(2, 40).await, Impl.add(2, 40).await);
        assert_eq!(p.ping().await, Ok(()));
    }

    #[tokio::test]
    async fn test_implementation_failure_surfaces_unchanged() {
        let err = proxy().explode("disk full".into()).await.unwrap_err();
        assert_eq!(err, CallError::remote("disk full"));
    }

    #[tokio::test]
    async fn test_stub_wire_format() {
        let stub = GreeterStub::new(Arc::new(Impl));
        let ctx = CallContext::new(caller());
        let reply = stub
            .transact(&ctx, Transaction::new("add", json!([1, 2])))
            .await
            .unwrap();
        assert_eq!(reply, json!(3));

        let reply = stub
            .transact(&ctx, Transaction::new("greet", json!(["x"])))
            .await
            .unwrap();
        assert_eq!(reply, json!("hello x"));
    }

    #[tokio::test]
    async fn test_stub_rejects_unknown_method() {
        let stub = GreeterStub::new(Arc::new(Impl));
        let ctx = CallContext::new(caller());
        let err = stub
            .transact(&ctx, Transaction::new("nope", json!(null)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CallError::UnknownMethod {
                descriptor: "test.IGreeter".into(),
                method: "nope".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_stub_rejects_malformed_arguments() {
        let stub = GreeterStub::new(Arc::new(Impl));
        let ctx = CallContext::new(caller());
        let err = stub
            .transact(&ctx, Transaction::new("add", json!(["one", 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidArguments { ref method, .. } if method == "add"));
    }

    #[test]
    fn test_as_endpoint_is_not_forwarded() {
        let p = proxy();
        assert_eq!(p.as_endpoint().descriptor(), "test.IGreeter");
        assert_eq!(p.as_channel().descriptor(), "test.IGreeter");
        assert_eq!(GreeterProxy::DESCRIPTOR, "test.IGreeter");
        assert_eq!(GreeterStub::<Impl>::DESCRIPTOR, "test.IGreeter");
    }
}
