//! Test doubles shared by the integration suite.
//!
//! [`LoopbackProcessor`] "starts" a chaincode by spawning an in-process fake
//! unit on one end of a [`DuplexStream`] pair and handing the other end to
//! the peer, the way a container would dial back.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ccsupport::CCContext;
use ccsupport::CancellationToken;
use ccsupport::ChaincodeContainerInfo;
use ccsupport::ChaincodeDefinition;
use ccsupport::ChaincodeStream;
use ccsupport::ChaincodeSupport;
use ccsupport::ChaincodeType;
use ccsupport::Config;
use ccsupport::DuplexStream;
use ccsupport::ExecutionEnvironment;
use ccsupport::Handler;
use ccsupport::HandlerError;
use ccsupport::Lifecycle;
use ccsupport::PackageProvider;
use ccsupport::Processor;
use ccsupport::QueryExecutor;
use ccsupport::runtime::ContainerRequest;
use ccwire::ChaincodeEvent;
use ccwire::ChaincodeId;
use ccwire::ChaincodeInput;
use ccwire::ChaincodeMessage;
use ccwire::MessageType;
use ccwire::Record;
use ccwire::Response;

/// How a fake unit answers one INIT or TRANSACTION; `None` never answers.
pub type UnitScript = Arc<dyn Fn(&ChaincodeMessage) -> Option<ChaincodeMessage> + Send + Sync>;

pub const TRANSFER_RESULT: &[u8] = b"{\"status\":200,\"result\":\"ok\"}";

fn reply(to: &ChaincodeMessage, message_type: MessageType, payload: Vec<u8>) -> ChaincodeMessage {
    ChaincodeMessage::new(message_type, to.channel_id.clone(), to.txid.clone(), payload)
}

fn completed(to: &ChaincodeMessage, payload: &[u8]) -> ChaincodeMessage {
    let response = Response::success(payload.to_vec());
    reply(to, MessageType::Completed, response.to_bytes().unwrap())
}

/// A token contract. Functions:
/// - `transfer`: succeeds and emits a `transferred` event
/// - `fail`: answers ERROR "insufficient funds"
/// - `hang`: never answers
/// - `origin`: returns the `origin` proposal decoration
pub fn token_contract() -> UnitScript {
    Arc::new(|msg| {
        let input = ChaincodeInput::from_bytes(&msg.payload).ok()?;
        if msg.message_type == MessageType::Init {
            return Some(completed(msg, b"initialized"));
        }

        let function = input.args.first().map(|a| String::from_utf8_lossy(a).into_owned()).unwrap_or_default();
        match function.as_str() {
            "transfer" => Some(completed(msg, TRANSFER_RESULT).with_event(ChaincodeEvent {
                event_name: "transferred".into(),
                payload: input.args.get(3).cloned().unwrap_or_default(),
                ..Default::default()
            })),
            "fail" => Some(reply(msg, MessageType::Error, b"insufficient funds".to_vec())),
            "hang" => None,
            "origin" => {
                let origin = input.decorations.get("origin").cloned().unwrap_or_default();
                Some(completed(msg, &origin))
            }
            other => Some(reply(msg, MessageType::Error, format!("unknown function {}", other).into_bytes())),
        }
    })
}

/// Runs a unit: registers as `id`, then answers requests with `script`
/// until the stream closes or registration is refused.
pub async fn run_unit<S: ChaincodeStream>(stream: S, id: ChaincodeId, script: UnitScript) {
    let register = ChaincodeMessage::new(MessageType::Register, "", "reg", id.to_bytes().unwrap());
    if stream.send(&register).await.is_err() {
        return;
    }

    while let Ok(Some(msg)) = stream.recv().await {
        match msg.message_type {
            MessageType::Registered | MessageType::Ready | MessageType::Keepalive => {}
            MessageType::Error => return,
            _ => {
                let Some(answer) = script(&msg) else { continue };
                if stream.send(&answer).await.is_err() {
                    return;
                }
            }
        }
    }
}

pub struct LoopbackProcessor {
    acceptor: mpsc::UnboundedSender<DuplexStream>,
    script: UnitScript,
    broken: Mutex<HashSet<String>>,
    units: Mutex<HashMap<String, JoinHandle<()>>>,
    requests: Mutex<Vec<(ExecutionEnvironment, ContainerRequest)>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl LoopbackProcessor {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Makes every start of `ccid` fail.
    pub fn break_image(&self, ccid: &str) {
        self.broken.lock().unwrap().insert(ccid.to_string());
    }

    pub fn requests(&self) -> Vec<(ExecutionEnvironment, ContainerRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for LoopbackProcessor {
    async fn process(&self, vm_type: ExecutionEnvironment, req: ContainerRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push((vm_type, req.clone()));

        match req {
            ContainerRequest::Start(start) => {
                self.starts.fetch_add(1, Ordering::SeqCst);
                if self.broken.lock().unwrap().contains(&start.ccid) {
                    bail!("image for {} not found", start.ccid);
                }

                let (name, version) = start.ccid.split_once(':').unwrap_or((start.ccid.as_str(), ""));
                let id = ChaincodeId::new(name, version);
                let (peer, unit) = DuplexStream::pair();
                let handle = tokio::spawn(run_unit(unit, id, self.script.clone()));
                self.units.lock().unwrap().insert(start.ccid.clone(), handle);
                self.acceptor.send(peer).map_err(|_| anyhow!("acceptor is gone"))
            }
            ContainerRequest::Stop(stop) => {
                self.stops.fetch_add(1, Ordering::SeqCst);
                if let Some(unit) = self.units.lock().unwrap().remove(&stop.ccid) {
                    unit.abort();
                }
                Ok(())
            }
        }
    }
}

/// Lifecycle backed by a fixed table of instantiated chaincodes.
#[derive(Default)]
pub struct StaticLifecycle {
    instantiated: HashMap<(String, String), ChaincodeContainerInfo>,
}

impl StaticLifecycle {
    pub fn with(mut self, channel_id: &str, ccci: ChaincodeContainerInfo) -> Self {
        self.instantiated.insert((channel_id.to_string(), ccci.name.clone()), ccci);
        self
    }
}

#[async_trait]
impl Lifecycle for StaticLifecycle {
    async fn chaincode_definition(
        &self,
        name: &str,
        query_executor: &dyn QueryExecutor,
    ) -> anyhow::Result<ChaincodeDefinition> {
        let version = query_executor
            .get_state("lscc", name)?
            .ok_or_else(|| anyhow!("chaincode {} not found", name))?;
        Ok(ChaincodeDefinition {
            name: name.to_string(),
            version: String::from_utf8(version)?,
            ..Default::default()
        })
    }

    async fn chaincode_container_info(&self, channel_id: &str, name: &str) -> anyhow::Result<ChaincodeContainerInfo> {
        self.instantiated
            .get(&(channel_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("chaincode {} not instantiated on channel {}", name, channel_id))
    }
}

/// World state as a flat map of `namespace/key`.
#[derive(Default)]
pub struct MapQueryExecutor(pub HashMap<String, Vec<u8>>);

impl QueryExecutor for MapQueryExecutor {
    fn get_state(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.0.get(&format!("{}/{}", namespace, key)).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryPackages(HashMap<(String, String), Vec<u8>>);

impl InMemoryPackages {
    pub fn with(mut self, name: &str, version: &str, package: &[u8]) -> Self {
        self.0.insert((name.to_string(), version.to_string()), package.to_vec());
        self
    }
}

impl PackageProvider for InMemoryPackages {
    fn get_chaincode_code_package(&self, name: &str, version: &str) -> anyhow::Result<Vec<u8>> {
        self.0
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no package for {}:{}", name, version))
    }
}

/// A handler that answers every execute with a fixed message.
pub struct ScriptedHandler {
    pub name: String,
    pub answer: ChaincodeMessage,
}

#[async_trait]
impl Handler for ScriptedHandler {
    fn chaincode_name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _cccid: &CCContext,
        _msg: ChaincodeMessage,
        _timeout: Duration,
    ) -> Result<ChaincodeMessage, HandlerError> {
        Ok(self.answer.clone())
    }
}

pub fn token_contract_info(version: &str) -> ChaincodeContainerInfo {
    ChaincodeContainerInfo {
        name: "token-contract".into(),
        version: version.into(),
        path: "github.com/example/token".into(),
        chaincode_type: ChaincodeType::Golang,
        container_type: ExecutionEnvironment::Docker,
    }
}

pub fn test_config() -> Config {
    Config {
        peer_address: "peer0:7052".into(),
        execute_timeout_ms: 5_000,
        startup_timeout_ms: 5_000,
        ..Config::default()
    }
}

pub struct Harness {
    pub support: Arc<ChaincodeSupport>,
    pub processor: Arc<LoopbackProcessor>,
}

impl Harness {
    /// A support wired to loopback containers, with "token-contract" v1
    /// instantiated on "ch1".
    pub fn new(config: Config) -> Self {
        let lifecycle = StaticLifecycle::default().with("ch1", token_contract_info("1"));
        let packages = InMemoryPackages::default()
            .with("token-contract", "1", b"token-v1")
            .with("token-contract", "2", b"token-v2");
        Self::with_parts(config, lifecycle, packages)
    }

    pub fn with_parts(config: Config, lifecycle: StaticLifecycle, packages: InMemoryPackages) -> Self {
        let (acceptor, mut incoming) = mpsc::unbounded_channel::<DuplexStream>();
        let processor = Arc::new(LoopbackProcessor {
            acceptor,
            script: token_contract(),
            broken: Mutex::new(HashSet::new()),
            units: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });

        let support = Arc::new(ChaincodeSupport::new(
            &config,
            processor.clone(),
            Arc::new(packages),
            Arc::new(lifecycle),
        ));

        let server = support.clone();
        tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.handle_chaincode_stream(Arc::new(stream)).await;
                });
            }
        });

        Self { support, processor }
    }
}

/// Polls until `cname` is registered, for units nobody launched.
pub async fn wait_registered(support: &ChaincodeSupport, cname: &str) {
    for _ in 0..200 {
        if support.registry().is_registered(cname) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never registered", cname);
}
