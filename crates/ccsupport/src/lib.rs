//! # ccsupport
//!
//! Launches, tracks and invokes chaincode units on behalf of a ledger peer.
//!
//! - [`registry`]: which chaincodes are connected, and which launches are in flight.
//! - [`launcher`]: "ensure running", collapsing concurrent launches into one start.
//! - [`runtime`]: starting and stopping the process or container of a chaincode.
//! - [`handler`]: the per-connection protocol driver and its timeout-bound execute.
//! - [`support`]: the invocation orchestrator tying the above together.

pub mod ccprovider;
pub mod config;
pub mod error;
pub mod handler;
pub mod launcher;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod stream;
pub mod support;

pub use ccprovider::CCContext;
pub use ccprovider::ChaincodeContainerInfo;
pub use ccprovider::ChaincodeDeploymentSpec;
pub use ccprovider::ChaincodeInvocationSpec;
pub use ccprovider::ChaincodeSpec;
pub use ccprovider::ChaincodeType;
pub use ccprovider::ExecutionEnvironment;
pub use config::Config;
pub use error::ConfigError;
pub use error::Error;
pub use error::ErrorKind;
pub use error::HandlerError;
pub use error::LaunchError;
pub use handler::Handler;
pub use handler::StreamHandler;
pub use handler::StreamOptions;
pub use launcher::Launcher;
pub use launcher::PackageProvider;
pub use launcher::RuntimeLauncher;
pub use lifecycle::ChaincodeDefinition;
pub use lifecycle::Lifecycle;
pub use lifecycle::QueryExecutor;
pub use registry::HandlerRegistry;
pub use runtime::ContainerRuntime;
pub use runtime::Processor;
pub use runtime::Runtime;
pub use stream::ChaincodeStream;
pub use stream::DuplexStream;
pub use stream::FramedStream;
pub use support::ChaincodeSupport;
pub use support::ExecutionResult;

pub use tokio_util::sync::CancellationToken;
