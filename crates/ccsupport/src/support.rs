//! # Chaincode Support
//!
//! The invocation orchestrator. Resolves the target chaincode, makes sure it
//! is running, sends it an INIT or TRANSACTION and interprets the answer.
//!
//! ## Flow
//!
//! ```text
//! execute ──► launch ──► Launcher ──► Runtime.start
//!    │                                    │ unit dials back
//!    │                                    ▼
//!    │                         StreamHandler ──► HandlerRegistry
//!    ▼
//! registry.handler ──► Handler.execute ──► process_chaincode_execution_result
//! ```
//!
//! Nothing here is retried. [`Error::kind`] tells the caller what failed and
//! [`Error::is_retryable`] whether trying again could help.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ccwire::ChaincodeEvent;
use ccwire::ChaincodeInput;
use ccwire::ChaincodeMessage;
use ccwire::MessageType;
use ccwire::Record;
use ccwire::Response;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::ccprovider::CCContext;
use crate::ccprovider::ChaincodeContainerInfo;
use crate::ccprovider::ChaincodeDeploymentSpec;
use crate::ccprovider::ChaincodeInvocationSpec;
use crate::ccprovider::canonical_name;
use crate::config::Config;
use crate::error::Error;
use crate::error::HandlerError;
use crate::handler::StreamHandler;
use crate::handler::StreamOptions;
use crate::handler::UuidGenerator;
use crate::handler::default_uuid_generator;
use crate::launcher::Launcher;
use crate::launcher::PackageProvider;
use crate::launcher::RuntimeLauncher;
use crate::lifecycle::Lifecycle;
use crate::registry::HandlerRegistry;
use crate::runtime::ContainerRuntime;
use crate::runtime::Processor;
use crate::runtime::Runtime;
use crate::stream::ChaincodeStream;
use crate::stream::FramedStream;

/// What a successful invocation hands back.
pub type ExecutionResult = (Response, Option<ChaincodeEvent>);

pub struct ChaincodeSupport {
    keepalive: Option<Duration>,
    execute_timeout: Duration,
    user_runs_cc: bool,
    runtime: Arc<dyn Runtime>,
    registry: Arc<HandlerRegistry>,
    launcher: Arc<dyn Launcher>,
    lifecycle: Arc<dyn Lifecycle>,
    uuid: UuidGenerator,
}

impl ChaincodeSupport {
    /// Wires the production stack: a [`ContainerRuntime`] over `processor`
    /// and a [`RuntimeLauncher`] sharing one registry.
    pub fn new(
        config: &Config,
        processor: Arc<dyn Processor>,
        package_provider: Arc<dyn PackageProvider>,
        lifecycle: Arc<dyn Lifecycle>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new(config.user_runs_cc));
        let runtime: Arc<dyn Runtime> = Arc::new(ContainerRuntime::new(
            processor,
            config.peer_address.clone(),
            config.logging.chaincode_env(),
        ));
        let launcher = Arc::new(RuntimeLauncher::new(
            runtime.clone(),
            registry.clone(),
            package_provider,
            config.startup_timeout(),
        ));

        Self {
            keepalive: config.keepalive(),
            execute_timeout: config.execute_timeout(),
            user_runs_cc: config.user_runs_cc,
            runtime,
            registry,
            launcher,
            lifecycle,
            uuid: default_uuid_generator(),
        }
    }

    pub fn from_parts(
        registry: Arc<HandlerRegistry>,
        runtime: Arc<dyn Runtime>,
        launcher: Arc<dyn Launcher>,
        lifecycle: Arc<dyn Lifecycle>,
        execute_timeout: Duration,
    ) -> Self {
        Self {
            keepalive: None,
            execute_timeout,
            user_runs_cc: false,
            runtime,
            registry,
            launcher,
            lifecycle,
            uuid: default_uuid_generator(),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_uuid_generator(mut self, uuid: UuidGenerator) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_user_runs_cc(mut self, user_runs_cc: bool) -> Self {
        self.user_runs_cc = user_runs_cc;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn execute_timeout(&self) -> Duration {
        self.execute_timeout
    }

    /// Ensures the chaincode being deployed is running. Container info comes
    /// from the deployment spec, since the definition may not be committed.
    pub async fn launch_init(&self, cccid: &CCContext, spec: &ChaincodeDeploymentSpec) -> Result<(), Error> {
        let cname = cccid.canonical_name();
        if self.registry.is_registered(&cname) {
            return Ok(());
        }

        let mut ccci = spec.container_info().ok_or(Error::MissingChaincodeSpec)?;
        ccci.version = cccid.version.clone();

        self.launcher.launch(&ccci).await.map_err(|source| Error::Launch {
            channel_id: cccid.chain_id.clone(),
            name: cname,
            source,
        })
    }

    /// Ensures an instantiated chaincode is running, resolving it through
    /// the lifecycle.
    pub async fn launch(&self, chain_id: &str, name: &str, version: &str) -> Result<(), Error> {
        let cname = canonical_name(name, version);
        if self.registry.is_registered(&cname) {
            return Ok(());
        }

        let mut ccci = match self.lifecycle.chaincode_container_info(chain_id, name).await {
            Ok(ccci) => ccci,
            Err(e) => {
                if self.user_runs_cc {
                    tracing::error!(
                        chaincode = %cname,
                        channel = chain_id,
                        "chaincode is not running and developer mode is on; was it deployed and started?"
                    );
                }
                return Err(Error::Resolution {
                    channel_id: chain_id.to_string(),
                    name: name.to_string(),
                    source: e.into(),
                });
            }
        };
        ccci.version = version.to_string();

        self.launcher.launch(&ccci).await.map_err(|source| Error::Launch {
            channel_id: chain_id.to_string(),
            name: cname,
            source,
        })
    }

    /// Stops the chaincode and forgets its handler. Executes racing with the
    /// stop either finish first or fail with a dispatch error.
    pub async fn stop(&self, ccci: &ChaincodeContainerInfo) -> Result<(), Error> {
        let cname = ccci.canonical_name();
        self.runtime.stop(ccci).await.map_err(|e| Error::Stop {
            name: cname.clone(),
            source: e.into(),
        })?;
        self.registry.deregister(&cname);
        tracing::info!(chaincode = %cname, "chaincode stopped");
        Ok(())
    }

    /// Serves a connection from a chaincode until it closes.
    pub async fn handle_chaincode_stream(&self, stream: Arc<dyn ChaincodeStream>) -> Result<(), HandlerError> {
        let opts = StreamOptions { keepalive: self.keepalive, uuid: self.uuid.clone() };
        StreamHandler::serve(stream, self.registry.clone(), opts).await
    }

    /// Serves a chaincode connected over a byte stream, e.g. a TCP socket.
    pub async fn register<T>(&self, io: T) -> Result<(), HandlerError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.handle_chaincode_stream(Arc::new(FramedStream::from_io(io))).await
    }

    /// Launches the chaincode being deployed and runs its INIT.
    pub async fn execute_init(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        spec: &ChaincodeDeploymentSpec,
    ) -> Result<ExecutionResult, Error> {
        let resp = self.invoke_init(cancel, cccid, spec).await?;
        process_chaincode_execution_result(cccid, resp)
    }

    /// Launches the chaincode and runs a TRANSACTION.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        spec: &ChaincodeInvocationSpec,
    ) -> Result<ExecutionResult, Error> {
        let resp = self.invoke(cancel, cccid, spec).await?;
        process_chaincode_execution_result(cccid, resp)
    }

    /// Like [`Self::execute_init`], but returns the raw terminal message.
    pub async fn invoke_init(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        spec: &ChaincodeDeploymentSpec,
    ) -> Result<ChaincodeMessage, Error> {
        let cc_spec = spec.chaincode_spec.as_ref().ok_or(Error::MissingChaincodeSpec)?;
        self.cancellable(cancel, cccid, self.launch_init(cccid, spec)).await?;

        let msg = create_cc_message(MessageType::Init, cccid, &cc_spec.input)?;
        self.execute_message(cancel, cccid, msg).await
    }

    /// Like [`Self::execute`], but returns the raw terminal message.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        spec: &ChaincodeInvocationSpec,
    ) -> Result<ChaincodeMessage, Error> {
        let cc_spec = spec.chaincode_spec.as_ref().ok_or(Error::MissingChaincodeSpec)?;
        let launch = self.launch(&cccid.chain_id, &cccid.name, &cccid.version);
        self.cancellable(cancel, cccid, launch).await?;

        let msg = create_cc_message(MessageType::Transaction, cccid, &cc_spec.input)?;
        self.execute_message(cancel, cccid, msg).await
    }

    /// Sends `msg` to the already running chaincode of `cccid` and waits for
    /// its terminal message, bounded by the execute timeout.
    pub async fn execute_message(
        &self,
        cancel: &CancellationToken,
        cccid: &CCContext,
        msg: ChaincodeMessage,
    ) -> Result<ChaincodeMessage, Error> {
        let cname = cccid.canonical_name();
        let Some(handler) = self.registry.handler(&cname) else {
            tracing::debug!(chaincode = %cname, channel = %cccid.chain_id, txid = %cccid.txid, "no handler");
            return Err(Error::Unreachable {
                channel_id: cccid.chain_id.clone(),
                name: cname,
                txid: cccid.txid.clone(),
            });
        };

        handler
            .execute(cancel, cccid, msg, self.execute_timeout)
            .await
            .map_err(|source| match source {
                HandlerError::Cancelled { txid } => Error::Cancelled {
                    channel_id: cccid.chain_id.clone(),
                    txid,
                },
                source => Error::Execute {
                    channel_id: cccid.chain_id.clone(),
                    name: cname,
                    txid: cccid.txid.clone(),
                    source,
                },
            })
    }

    async fn cancellable<F>(&self, cancel: &CancellationToken, cccid: &CCContext, fut: F) -> Result<(), Error>
    where
        F: Future<Output = Result<(), Error>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled {
                channel_id: cccid.chain_id.clone(),
                txid: cccid.txid.clone(),
            }),
            res = fut => res,
        }
    }
}

/// Builds an INIT or TRANSACTION for `cccid`, carrying its proposal
/// decorations in the input.
pub fn create_cc_message(
    message_type: MessageType,
    cccid: &CCContext,
    input: &ChaincodeInput,
) -> Result<ChaincodeMessage, Error> {
    let mut input = input.clone();
    input.decorations = cccid.proposal_decorations.clone();
    let payload = input.to_bytes().map_err(Error::Encode)?;
    Ok(ChaincodeMessage::new(message_type, cccid.chain_id.clone(), cccid.txid.clone(), payload))
}

/// Interprets the terminal message of an invocation. Any emitted event is
/// stamped with the chaincode name and transaction id here.
pub fn process_chaincode_execution_result(
    cccid: &CCContext,
    resp: ChaincodeMessage,
) -> Result<ExecutionResult, Error> {
    let txid = cccid.txid.clone();
    let event = resp.chaincode_event.map(|mut event| {
        event.chaincode_id = cccid.name.clone();
        event.tx_id = txid.clone();
        event
    });

    if resp.txid != txid {
        return Err(Error::MismatchedResponse { txid, received: resp.txid });
    }

    match resp.message_type {
        MessageType::Completed => {
            let response =
                Response::from_bytes(&resp.payload).map_err(|source| Error::MalformedResponse { txid, source })?;
            Ok((response, event))
        }
        MessageType::Error => Err(Error::Remote {
            txid,
            message: String::from_utf8_lossy(&resp.payload).into_owned(),
            payload: resp.payload,
            event,
        }),
        message_type => Err(Error::UnexpectedResponse { txid, message_type }),
    }
}
