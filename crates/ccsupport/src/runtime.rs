//! # Runtime
//!
//! Starting and stopping the process behind a chaincode. [`Runtime::start`]
//! returns once the start has been requested; readiness is observed through
//! the registry, never through this call.
//!
//! [`ContainerRuntime`] turns container info into start/stop requests for a
//! [`Processor`], the component that actually drives containers.

use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;

use crate::ccprovider::ChaincodeContainerInfo;
use crate::ccprovider::ChaincodeType;
use crate::ccprovider::ExecutionEnvironment;

#[async_trait::async_trait]
pub trait Runtime: Send + Sync + 'static {
    async fn start(&self, ccci: &ChaincodeContainerInfo, code_package: Vec<u8>) -> anyhow::Result<()>;

    async fn stop(&self, ccci: &ChaincodeContainerInfo) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartContainerRequest {
    /// Canonical name of the chaincode; doubles as the container id.
    pub ccid: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub code_package: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopContainerRequest {
    pub ccid: String,
    /// Seconds to wait before killing; 0 kills immediately.
    pub timeout: u32,
    pub dont_kill: bool,
    pub dont_remove: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRequest {
    Start(StartContainerRequest),
    Stop(StopContainerRequest),
}

/// Executes container requests for one kind of execution environment.
#[async_trait::async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, vm_type: ExecutionEnvironment, req: ContainerRequest) -> anyhow::Result<()>;
}

pub struct ContainerRuntime {
    processor: Arc<dyn Processor>,
    peer_address: String,
    common_env: Vec<String>,
}

impl ContainerRuntime {
    /// `common_env` is passed to every chaincode, ahead of its own variables.
    pub fn new(processor: Arc<dyn Processor>, peer_address: impl Into<String>, common_env: Vec<String>) -> Self {
        Self { processor, peer_address: peer_address.into(), common_env }
    }

    /// Command line and environment a chaincode of this type starts with.
    pub fn launch_config(&self, cname: &str, chaincode_type: ChaincodeType) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        let addr = &self.peer_address;
        let args: Vec<String> = match chaincode_type {
            ChaincodeType::Golang | ChaincodeType::Car => {
                vec!["chaincode".into(), format!("-peer.address={}", addr)]
            }
            ChaincodeType::Java => vec![
                "/root/chaincode-java/start".into(),
                "--peerAddress".into(),
                addr.clone(),
            ],
            ChaincodeType::Node => vec![
                "/bin/sh".into(),
                "-c".into(),
                format!("cd /usr/local/src; npm start -- --peer.address {}", addr),
            ],
            other => bail!("unknown chaincodeType: {}", other),
        };

        let mut env = self.common_env.clone();
        env.push(format!("CORE_CHAINCODE_ID_NAME={}", cname));
        env.push("CORE_PEER_TLS_ENABLED=false".into());

        tracing::debug!(chaincode = cname, ?args, "launch config");
        Ok((args, env))
    }
}

#[async_trait::async_trait]
impl Runtime for ContainerRuntime {
    async fn start(&self, ccci: &ChaincodeContainerInfo, code_package: Vec<u8>) -> anyhow::Result<()> {
        let cname = ccci.canonical_name();
        let (args, env) = self.launch_config(&cname, ccci.chaincode_type)?;

        tracing::debug!(chaincode = %cname, container_type = %ccci.container_type, "starting container");
        let req = StartContainerRequest { ccid: cname.clone(), args, env, code_package };
        self.processor
            .process(ccci.container_type, ContainerRequest::Start(req))
            .await
            .context("error starting container")?;
        tracing::debug!(chaincode = %cname, "container started");
        Ok(())
    }

    async fn stop(&self, ccci: &ChaincodeContainerInfo) -> anyhow::Result<()> {
        let req = StopContainerRequest {
            ccid: ccci.canonical_name(),
            timeout: 0,
            dont_kill: false,
            dont_remove: false,
        };
        self.processor
            .process(ccci.container_type, ContainerRequest::Stop(req))
            .await
            .context("error stopping container")
    }
}
