//! # Launcher
//!
//! "Ensure running": after a successful [`Launcher::launch`] a handler for
//! the chaincode is registered and ready.
//!
//! ## Single flight
//!
//! The first caller for a canonical name creates its launch state in the
//! registry and spawns the start; every caller, the first included, then
//! waits on that state. Concurrent callers for one name therefore trigger
//! one start and observe one outcome. Callers for different names never
//! touch each other's state.
//!
//! The start runs in its own task, so a caller that gives up early does not
//! strand the others.

use std::sync::Arc;
use std::time::Duration;

use crate::ccprovider::ChaincodeContainerInfo;
use crate::ccprovider::ExecutionEnvironment;
use crate::error::LaunchError;
use crate::registry::HandlerRegistry;
use crate::registry::LaunchState;
use crate::runtime::Runtime;

#[async_trait::async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, ccci: &ChaincodeContainerInfo) -> Result<(), LaunchError>;
}

/// Source of chaincode code packages.
pub trait PackageProvider: Send + Sync + 'static {
    fn get_chaincode_code_package(&self, name: &str, version: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct RuntimeLauncher {
    runtime: Arc<dyn Runtime>,
    registry: Arc<HandlerRegistry>,
    package_provider: Arc<dyn PackageProvider>,
    startup_timeout: Duration,
}

impl RuntimeLauncher {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        registry: Arc<HandlerRegistry>,
        package_provider: Arc<dyn PackageProvider>,
        startup_timeout: Duration,
    ) -> Self {
        Self { runtime, registry, package_provider, startup_timeout }
    }

    async fn start_and_wait(&self, ccci: &ChaincodeContainerInfo, state: &LaunchState) -> Result<(), LaunchError> {
        let cname = ccci.canonical_name();

        let code_package = match ccci.container_type {
            ExecutionEnvironment::System => Vec::new(),
            ExecutionEnvironment::Docker => self
                .package_provider
                .get_chaincode_code_package(&ccci.name, &ccci.version)
                .map_err(|e| LaunchError::Package { name: cname.clone(), message: format!("{:#}", e) })?,
        };

        let runtime = self.runtime.clone();
        let start_ccci = ccci.clone();
        let start = tokio::spawn(async move { runtime.start(&start_ccci, code_package).await });
        let start_failed = async move {
            match start.await {
                Ok(Ok(())) => std::future::pending::<String>().await,
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => e.to_string(),
            }
        };

        tokio::select! {
            outcome = state.wait() => outcome,
            message = start_failed => Err(LaunchError::Start { name: cname, message }),
            _ = tokio::time::sleep(self.startup_timeout) => Err(LaunchError::Timeout {
                name: cname,
                timeout: self.startup_timeout,
            }),
        }
    }
}

#[async_trait::async_trait]
impl Launcher for RuntimeLauncher {
    async fn launch(&self, ccci: &ChaincodeContainerInfo) -> Result<(), LaunchError> {
        let cname = ccci.canonical_name();
        if self.registry.is_registered(&cname) {
            return Ok(());
        }

        let (state, already_started) = self.registry.launching(&cname);
        if !already_started {
            tracing::info!(chaincode = %cname, "launching chaincode");
            let launcher = self.clone();
            let ccci = ccci.clone();
            let state = state.clone();
            tokio::spawn(async move {
                match launcher.start_and_wait(&ccci, &state).await {
                    Ok(()) => tracing::debug!(chaincode = %state.name(), "chaincode launched"),
                    Err(err) => {
                        tracing::error!(chaincode = %state.name(), error = %err, "chaincode launch failed");
                        launcher.registry.failed(state.name(), &state, err);
                    }
                }
            });
        }

        state.wait().await
    }
}
