//! End-to-end tests: invocations driven through launch, registration over a
//! stream and execution against fake units.

mod common;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use ccsupport::CCContext;
use ccsupport::CancellationToken;
use ccsupport::ChaincodeDeploymentSpec;
use ccsupport::ChaincodeInvocationSpec;
use ccsupport::ChaincodeSpec;
use ccsupport::ChaincodeSupport;
use ccsupport::ChaincodeType;
use ccsupport::Error;
use ccsupport::ErrorKind;
use ccsupport::ExecutionEnvironment;
use ccsupport::FramedStream;
use ccsupport::HandlerRegistry;
use ccsupport::Lifecycle;
use ccsupport::RuntimeLauncher;
use ccsupport::runtime::ContainerRequest;
use ccwire::ChaincodeId;
use ccwire::ChaincodeInput;
use ccwire::ChaincodeMessage;
use ccwire::MessageType;
use ccwire::Response;
use rand::Rng;

use common::Harness;
use common::InMemoryPackages;
use common::MapQueryExecutor;
use common::ScriptedHandler;
use common::StaticLifecycle;
use common::TRANSFER_RESULT;

fn invocation(function: &str) -> ChaincodeInvocationSpec {
    ChaincodeInvocationSpec {
        chaincode_spec: Some(ChaincodeSpec {
            chaincode_type: ChaincodeType::Golang,
            chaincode_id: ChaincodeId::new("token-contract", "1"),
            input: ChaincodeInput::from_args([function, "alice", "bob", "5"]),
        }),
    }
}

fn deployment(version: &str) -> ChaincodeDeploymentSpec {
    ChaincodeDeploymentSpec {
        chaincode_spec: Some(ChaincodeSpec {
            chaincode_type: ChaincodeType::Node,
            chaincode_id: ChaincodeId::new("token-contract", version),
            input: ChaincodeInput::from_args(["init", "alice", "100"]),
        }),
        exec_env: ExecutionEnvironment::Docker,
    }
}

fn tx(txid: &str) -> CCContext {
    CCContext::new("ch1", "token-contract", "1", txid, false)
}

#[tokio::test]
async fn test_token_contract_scenario() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();

    let (response, event) = h.support.execute(&cancel, &tx("t1"), &invocation("transfer")).await.unwrap();

    assert_eq!(response.status, Response::OK);
    assert_eq!(response.payload, TRANSFER_RESULT);
    let event = event.expect("transfer emits an event");
    assert_eq!(event.tx_id, "t1");
    assert_eq!(event.chaincode_id, "token-contract");
    assert_eq!(event.payload, b"5");

    assert_eq!(h.processor.starts(), 1);
    match &h.processor.requests()[0] {
        (ExecutionEnvironment::Docker, ContainerRequest::Start(start)) => {
            assert_eq!(start.ccid, "token-contract:1");
            assert_eq!(start.code_package, b"token-v1");
            assert_eq!(start.args, ["chaincode", "-peer.address=peer0:7052"]);
            assert!(start.env.contains(&"CORE_CHAINCODE_ID_NAME=token-contract:1".to_string()));
            assert!(start.env.contains(&"CORE_CHAINCODE_LOGGING_SHIM=warning".to_string()));
        }
        other => panic!("unexpected request {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_invokes_launch_once() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();

    h.support.execute(&cancel, &tx("t1"), &invocation("transfer")).await.unwrap();
    h.support.execute(&cancel, &tx("t2"), &invocation("transfer")).await.unwrap();

    assert_eq!(h.processor.starts(), 1);
}

#[tokio::test]
async fn test_concurrent_invokes_share_one_launch() {
    let h = Harness::new(common::test_config());

    let mut tasks = Vec::new();
    for i in 0..12 {
        let support = h.support.clone();
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..20));
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            let cancel = CancellationToken::new();
            let cccid = tx(&format!("t{}", i));
            support.execute(&cancel, &cccid, &invocation("transfer")).await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let (response, event) = task.await.unwrap().unwrap();
        assert_eq!(response.status, Response::OK);
        assert_eq!(event.unwrap().tx_id, format!("t{}", i));
    }
    assert_eq!(h.processor.starts(), 1);
}

#[tokio::test]
async fn test_remote_failure_carries_unit_text() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();

    let err = h.support.execute(&cancel, &tx("t1"), &invocation("fail")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("insufficient funds"), "got {}", err);
}

#[tokio::test]
async fn test_decorations_reach_the_unit() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();

    let mut decorations = BTreeMap::new();
    decorations.insert("origin".to_string(), b"gateway-7".to_vec());
    let cccid = tx("t1").with_decorations(decorations);

    let (response, _) = h.support.execute(&cancel, &cccid, &invocation("origin")).await.unwrap();
    assert_eq!(response.payload, b"gateway-7");
}

#[tokio::test]
async fn test_execute_init_launches_from_deployment_spec() {
    // Nothing is instantiated yet: the init path must not consult the lifecycle.
    let packages = InMemoryPackages::default().with("token-contract", "2", b"token-v2");
    let h = Harness::with_parts(common::test_config(), StaticLifecycle::default(), packages);
    let cancel = CancellationToken::new();
    let cccid = CCContext::new("ch1", "token-contract", "2", "deploy-1", false);

    let (response, event) = h.support.execute_init(&cancel, &cccid, &deployment("2")).await.unwrap();

    assert_eq!(response.payload, b"initialized");
    assert!(event.is_none());
    assert_eq!(h.processor.starts(), 1);
    match &h.processor.requests()[0] {
        (_, ContainerRequest::Start(start)) => {
            assert_eq!(start.ccid, "token-contract:2");
            assert_eq!(start.args[0], "/bin/sh");
        }
        other => panic!("unexpected request {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_chaincode_spec() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();

    let err = h
        .support
        .execute(&cancel, &tx("t1"), &ChaincodeInvocationSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingChaincodeSpec), "got {:?}", err);
    assert_eq!(err.kind(), ErrorKind::Request);
    assert_eq!(h.processor.starts(), 0);
}

#[tokio::test]
async fn test_unknown_chaincode_is_resolution_error() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();
    let cccid = CCContext::new("ch2", "token-contract", "1", "t1", false);

    let err = h.support.execute(&cancel, &cccid, &invocation("transfer")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Resolution);
    let chain = format!("{:#}", anyhow::Error::from(err));
    assert!(chain.contains("not instantiated on channel ch2"), "got {}", chain);
    assert_eq!(h.processor.starts(), 0);
}

#[tokio::test]
async fn test_start_failure_is_retryable_launch_error() {
    let h = Harness::new(common::test_config());
    h.processor.break_image("token-contract:1");
    let cancel = CancellationToken::new();

    let err = h.support.execute(&cancel, &tx("t1"), &invocation("transfer")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert!(err.is_retryable());
    let chain = format!("{:?}", anyhow::Error::from(err));
    assert!(chain.contains("error starting container"), "got {}", chain);

    // The failed launch left nothing behind; a second attempt starts again.
    let err = h.support.execute(&cancel, &tx("t2"), &invocation("transfer")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(h.processor.starts(), 2);
}

#[tokio::test]
async fn test_execute_after_stop_is_dispatch_error() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();
    h.support.execute(&cancel, &tx("t1"), &invocation("transfer")).await.unwrap();

    h.support.stop(&common::token_contract_info("1")).await.unwrap();
    assert_eq!(h.processor.stops(), 1);

    let msg = ChaincodeMessage::new(MessageType::Transaction, "ch1", "t2", Vec::new());
    let err = h.support.execute_message(&cancel, &tx("t2"), msg).await.unwrap_err();
    assert!(matches!(err, Error::Unreachable { .. }), "got {:?}", err);
    assert_eq!(err.kind(), ErrorKind::Dispatch);

    // A full invocation relaunches: running state always comes from the registry.
    h.support.execute(&cancel, &tx("t3"), &invocation("transfer")).await.unwrap();
    assert_eq!(h.processor.starts(), 2);
}

#[tokio::test]
async fn test_stop_ends_in_flight_execute() {
    let h = Harness::new(common::test_config());

    let support = h.support.clone();
    let in_flight = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        support.execute(&cancel, &tx("t1"), &invocation("hang")).await
    });
    common::wait_registered(&h.support, "token-contract:1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.support.stop(&common::token_contract_info("1")).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(3), in_flight)
        .await
        .expect("execute kept waiting after stop")
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, Error::Execute { source: ccsupport::HandlerError::Disconnected(_), .. }),
        "got {:?}",
        err
    );
    assert_eq!(err.kind(), ErrorKind::Dispatch);
    assert!(!h.support.registry().is_registered("token-contract:1"));
}

#[tokio::test]
async fn test_cancellation_while_unit_is_silent() {
    let h = Harness::new(common::test_config());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = h.support.execute(&cancel, &tx("t1"), &invocation("hang")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_silent_unit_times_out() {
    let mut config = common::test_config();
    config.execute_timeout_ms = 1_000;
    let h = Harness::new(config);
    let cancel = CancellationToken::new();

    let err = h.support.execute(&cancel, &tx("t1"), &invocation("hang")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());

    // The unit is still usable afterwards.
    h.support.execute(&cancel, &tx("t2"), &invocation("transfer")).await.unwrap();
}

#[tokio::test]
async fn test_user_run_chaincode_over_framed_io() {
    let mut config = common::test_config();
    config.user_runs_cc = true;
    let h = Harness::new(config);

    let (peer_io, unit_io) = tokio::io::duplex(64 * 1024);
    let server = h.support.clone();
    tokio::spawn(async move { server.register(peer_io).await });
    tokio::spawn(common::run_unit(
        FramedStream::from_io(unit_io),
        ChaincodeId::new("token-contract", "1"),
        common::token_contract(),
    ));
    common::wait_registered(&h.support, "token-contract:1").await;

    let cancel = CancellationToken::new();
    let (response, _) = h.support.execute(&cancel, &tx("t1"), &invocation("transfer")).await.unwrap();

    assert_eq!(response.payload, TRANSFER_RESULT);
    assert_eq!(h.processor.starts(), 0);
}

#[tokio::test]
async fn test_unsolicited_connection_is_refused() {
    let h = Harness::new(common::test_config());

    let (peer_io, unit_io) = tokio::io::duplex(64 * 1024);
    let unit = tokio::spawn(common::run_unit(
        FramedStream::from_io(unit_io),
        ChaincodeId::new("token-contract", "1"),
        common::token_contract(),
    ));

    let err = h.support.register(peer_io).await.unwrap_err();
    assert!(err.to_string().contains("external chaincode connection"), "got {}", err);
    unit.await.unwrap();
    assert!(!h.support.registry().is_registered("token-contract:1"));
}

#[tokio::test]
async fn test_non_terminal_answer_is_protocol_error() {
    let registry = Arc::new(HandlerRegistry::new(true));
    let lifecycle = Arc::new(StaticLifecycle::default().with("ch1", common::token_contract_info("1")));
    let packages = Arc::new(InMemoryPackages::default());
    let runtime = Arc::new(ccsupport::ContainerRuntime::new(
        Arc::new(NoContainers),
        "peer0:7052",
        Vec::new(),
    ));
    let launcher = Arc::new(RuntimeLauncher::new(
        runtime.clone(),
        registry.clone(),
        packages,
        Duration::from_secs(5),
    ));
    let support = ChaincodeSupport::from_parts(registry.clone(), runtime, launcher, lifecycle, Duration::from_secs(5));

    let answer = ChaincodeMessage::new(MessageType::PutState, "ch1", "t1", Vec::new());
    registry
        .register(Arc::new(ScriptedHandler { name: "token-contract:1".into(), answer }))
        .unwrap();

    let cancel = CancellationToken::new();
    let err = support.execute(&cancel, &tx("t1"), &invocation("transfer")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(matches!(err, Error::UnexpectedResponse { message_type: MessageType::PutState, .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_lifecycle_definition_lookup() {
    let lifecycle = StaticLifecycle::default();
    let state = MapQueryExecutor(HashMap::from([("lscc/token-contract".to_string(), b"1".to_vec())]));

    let definition = lifecycle.chaincode_definition("token-contract", &state).await.unwrap();
    assert_eq!(definition.version, "1");
    assert!(lifecycle.chaincode_definition("unknown", &state).await.is_err());
}

struct NoContainers;

#[async_trait::async_trait]
impl ccsupport::Processor for NoContainers {
    async fn process(&self, _vm_type: ExecutionEnvironment, _req: ContainerRequest) -> anyhow::Result<()> {
        anyhow::bail!("containers are not available")
    }
}
